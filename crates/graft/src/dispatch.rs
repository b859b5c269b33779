//! Runtime resolution and hooking of dispatch-table methods.
//!
//! Some methods are never exposed as ordinary functions: they are only
//! reachable through the dispatch table of a live object obtained
//! opportunistically at runtime. The resolver reads the table pointer
//! (the first machine word of the instance), extracts the entry at a
//! fixed slot index, and installs a hook for it through the registry —
//! exactly once per distinct table, no matter how many instances share
//! it.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hooks::{HookBackend, HookRegistry, HookRequest, HookSlot, RawEntryPoint};
use crate::stub::PointerWidth;

/// Read a pointer-sized word from the instrumented address space.
pub trait ReadWord {
    fn width(&self) -> PointerWidth;
    fn read_word(&self, address: u64) -> Result<u64>;
}

/// A method's position in a dispatch table: interface-version-specific
/// and fixed at compile time of the target, so a plain integer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySlot {
    pub name: &'static str,
    pub index: usize,
}

impl CapabilitySlot {
    pub const fn new(name: &'static str, index: usize) -> Self {
        Self { name, index }
    }
}

/// A slot paired with the replacement that should service it.
#[derive(Debug, Clone, Copy)]
pub struct MethodHook {
    pub slot: CapabilitySlot,
    pub replacement: RawEntryPoint,
}

/// Outcome of resolving one slot on one instance.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedMethod {
    pub table: RawEntryPoint,
    pub slot: HookSlot,
    pub entry: RawEntryPoint,
    /// True if this table's methods were hooked by an earlier
    /// resolution and the installed hook should simply be reused.
    pub already_hooked: bool,
}

/// Tracks which dispatch tables have had their methods captured.
#[derive(Default)]
pub struct DispatchTableHookResolver {
    resolved_tables: HashSet<RawEntryPoint>,
}

impl DispatchTableHookResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the instance's dispatch-table pointer and the entry at
    /// `slot.index`, without installing anything.
    pub fn resolve<R: ReadWord>(
        &self,
        reader: &R,
        instance: u64,
        slot: &CapabilitySlot,
    ) -> Result<ResolvedMethod> {
        let table = reader.read_word(instance)?;
        let entry = reader.read_word(table + (slot.index * reader.width().bytes()) as u64)?;
        if entry == 0 {
            return Err(Error::HookAttachFailed(format!(
                "null dispatch entry for {} (slot {})",
                slot.name, slot.index
            )));
        }

        Ok(ResolvedMethod {
            table,
            slot: HookSlot::Dispatch {
                table,
                index: slot.index,
            },
            entry,
            already_hooked: self.resolved_tables.contains(&table),
        })
    }

    /// Resolve `methods` on `instance` and install them through the
    /// registry as one transaction, exactly once per dispatch table.
    ///
    /// Returns `Ok(true)` when the hooks were installed now and
    /// `Ok(false)` when the instance shares a table resolved earlier,
    /// in which case nothing is re-attached and subsequent calls on
    /// the new instance reach the already-installed hooks.
    pub fn hook_methods_once<R: ReadWord, B: HookBackend>(
        &mut self,
        reader: &R,
        registry: &mut HookRegistry<B>,
        instance: u64,
        methods: &[MethodHook],
    ) -> Result<bool> {
        let table = reader.read_word(instance)?;
        if self.resolved_tables.contains(&table) {
            debug!("dispatch table {:#x} already hooked, reusing", table);
            return Ok(false);
        }

        let mut transaction = registry.begin_transaction();
        for method in methods {
            let resolved = self.resolve(reader, instance, &method.slot)?;
            transaction.attach(HookRequest {
                slot: resolved.slot,
                original: resolved.entry,
                replacement: method.replacement,
            })?;
        }
        transaction.commit()?;

        self.resolved_tables.insert(table);
        debug!(
            "hooked {} method(s) on dispatch table {:#x}",
            methods.len(),
            table
        );
        Ok(true)
    }
}

/// One level of a chained resolution: the methods to hook on the
/// interface that this stage's instance exposes.
pub struct ChainStage {
    pub name: &'static str,
    pub methods: Vec<MethodHook>,
    established: bool,
}

impl ChainStage {
    pub fn new(name: &'static str, methods: Vec<MethodHook>) -> Self {
        Self {
            name,
            methods,
            established: false,
        }
    }
}

/// An explicit chain of dependent dispatch-table resolutions.
///
/// Each stage can only be established from a live instance, and that
/// instance only becomes observable through the previous stage's hook
/// (e.g. an enumerator surfaces sessions, a session surfaces its
/// control interface). A stage's hook calls `establish` for the next
/// stage the first time it sees a suitable instance, then forwards to
/// its own original; the chain is never constructed eagerly.
pub struct DispatchChain {
    stages: Vec<ChainStage>,
    resolver: DispatchTableHookResolver,
}

impl DispatchChain {
    pub fn new(stages: Vec<ChainStage>) -> Self {
        Self {
            stages,
            resolver: DispatchTableHookResolver::new(),
        }
    }

    pub fn is_established(&self, stage: usize) -> bool {
        self.stages.get(stage).is_some_and(|s| s.established)
    }

    pub fn is_complete(&self) -> bool {
        self.stages.iter().all(|s| s.established)
    }

    /// Establish one stage from a live instance. Idempotent: an
    /// already-established stage (or an instance sharing an
    /// already-hooked table) returns `Ok(false)` without touching any
    /// hook.
    pub fn establish<R: ReadWord, B: HookBackend>(
        &mut self,
        stage: usize,
        reader: &R,
        registry: &mut HookRegistry<B>,
        instance: u64,
    ) -> Result<bool> {
        let entry = self.stages.get_mut(stage).ok_or_else(|| {
            Error::HookAttachFailed(format!("chain has no stage {}", stage))
        })?;
        if entry.established {
            return Ok(false);
        }

        let installed =
            self.resolver
                .hook_methods_once(reader, registry, instance, &entry.methods)?;
        entry.established = true;
        if installed {
            debug!("chain stage '{}' established", entry.name);
        }
        Ok(installed)
    }

    /// Establish the first not-yet-established stage from `instance`.
    /// Returns `Ok(false)` when the chain is already complete.
    pub fn advance<R: ReadWord, B: HookBackend>(
        &mut self,
        reader: &R,
        registry: &mut HookRegistry<B>,
        instance: u64,
    ) -> Result<bool> {
        match self.stages.iter().position(|s| !s.established) {
            Some(stage) => self.establish(stage, reader, registry, instance),
            None => Ok(false),
        }
    }
}

/// In-process word reader for the live target.
#[cfg(target_os = "windows")]
pub mod os {
    use super::ReadWord;
    use crate::error::Result;
    use crate::stub::PointerWidth;

    /// Reads words directly from the current address space.
    pub struct LiveWordReader;

    impl LiveWordReader {
        /// # Safety
        ///
        /// Every address later passed to `read_word` must point at
        /// readable memory of at least pointer size; instances handed
        /// to the resolver by intercepted calls satisfy this.
        pub unsafe fn new() -> Self {
            Self
        }
    }

    impl ReadWord for LiveWordReader {
        fn width(&self) -> PointerWidth {
            PointerWidth::native()
        }

        fn read_word(&self, address: u64) -> Result<u64> {
            let value = unsafe { std::ptr::read(address as *const usize) };
            Ok(value as u64)
        }
    }
}
