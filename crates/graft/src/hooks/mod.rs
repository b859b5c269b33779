//! Transactional pointer-swap hook management.
//!
//! `HookRegistry` owns every installed hook entry. Installation goes
//! through `HookTransaction`: an ordered batch of attach requests that
//! either all become active on commit or none do — a mid-batch attach
//! failure detaches the entries already applied before the error is
//! returned. After setup completes the entry table is read-only, so
//! steady-state forwarding needs no synchronization.

#[cfg(target_os = "windows")]
mod backend;

#[cfg(target_os = "windows")]
pub use backend::DetourBackend;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A function entry point as a raw address.
pub type RawEntryPoint = u64;

/// Identity of a hookable slot: either a statically known function or
/// a dispatch-table entry discovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSlot {
    Function(RawEntryPoint),
    Dispatch { table: RawEntryPoint, index: usize },
}

/// A single installed hook, owned exclusively by the registry.
#[derive(Debug, Clone)]
pub struct HookEntry {
    pub slot: HookSlot,
    pub original: RawEntryPoint,
    pub replacement: RawEntryPoint,
    /// Entry point that forwards to the unhooked implementation.
    pub trampoline: RawEntryPoint,
    pub installed: bool,
}

/// An installation request queued on a transaction.
#[derive(Debug, Clone, Copy)]
pub struct HookRequest {
    pub slot: HookSlot,
    pub original: RawEntryPoint,
    pub replacement: RawEntryPoint,
}

impl HookRequest {
    pub fn function(original: RawEntryPoint, replacement: RawEntryPoint) -> Self {
        Self {
            slot: HookSlot::Function(original),
            original,
            replacement,
        }
    }

    pub fn dispatch(
        table: RawEntryPoint,
        index: usize,
        original: RawEntryPoint,
        replacement: RawEntryPoint,
    ) -> Self {
        Self {
            slot: HookSlot::Dispatch { table, index },
            original,
            replacement,
        }
    }
}

/// Platform trampoline-hooking primitive.
pub trait HookBackend {
    /// Redirect `original` to `replacement`, returning the trampoline
    /// through which the original implementation stays callable.
    fn attach(&mut self, original: RawEntryPoint, replacement: RawEntryPoint)
    -> Result<RawEntryPoint>;

    /// Undo a previous attach.
    fn detach(&mut self, original: RawEntryPoint, replacement: RawEntryPoint) -> Result<()>;
}

/// Owner of all hook entries, constructed once at startup and queried
/// thereafter.
pub struct HookRegistry<B: HookBackend> {
    backend: B,
    entries: HashMap<HookSlot, HookEntry>,
}

impl<B: HookBackend> HookRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            entries: HashMap::new(),
        }
    }

    pub fn begin_transaction(&mut self) -> HookTransaction<'_, B> {
        HookTransaction {
            registry: self,
            requests: Vec::new(),
            state: TransactionState::Open,
        }
    }

    pub fn is_installed(&self, slot: &HookSlot) -> bool {
        self.entries.get(slot).is_some_and(|e| e.installed)
    }

    /// The trampoline to forward through for an installed slot.
    pub fn original(&self, slot: &HookSlot) -> Option<RawEntryPoint> {
        self.entries
            .get(slot)
            .filter(|e| e.installed)
            .map(|e| e.trampoline)
    }

    pub fn installed_count(&self) -> usize {
        self.entries.values().filter(|e| e.installed).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
}

/// An ordered, all-or-nothing batch of hook installations.
pub struct HookTransaction<'r, B: HookBackend> {
    registry: &'r mut HookRegistry<B>,
    requests: Vec<HookRequest>,
    state: TransactionState,
}

impl<B: HookBackend> HookTransaction<'_, B> {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Queue an installation request.
    ///
    /// Rejects null originals, slots already installed in the
    /// registry, and duplicate slots within this transaction.
    pub fn attach(&mut self, request: HookRequest) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(Error::TransactionAborted(
                "transaction already terminated".to_string(),
            ));
        }
        if request.original == 0 {
            return Err(Error::HookAttachFailed(
                "null original entry point".to_string(),
            ));
        }
        if self.registry.is_installed(&request.slot)
            || self.requests.iter().any(|r| r.slot == request.slot)
        {
            return Err(Error::HookAttachFailed(format!(
                "slot {:?} already hooked",
                request.slot
            )));
        }

        self.requests.push(request);
        Ok(())
    }

    /// Apply every queued request in order. On any attach failure the
    /// entries attached so far are detached again, in reverse order,
    /// before the error is returned: callers observe either all
    /// requested hooks active or none.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(Error::TransactionAborted(
                "transaction already terminated".to_string(),
            ));
        }

        let mut applied: Vec<(HookRequest, RawEntryPoint)> = Vec::new();
        for request in &self.requests {
            match self
                .registry
                .backend
                .attach(request.original, request.replacement)
            {
                Ok(trampoline) => applied.push((*request, trampoline)),
                Err(err) => {
                    for (done, _) in applied.iter().rev() {
                        if let Err(detach_err) =
                            self.registry.backend.detach(done.original, done.replacement)
                        {
                            warn!(
                                "rollback detach of {:#x} failed: {}",
                                done.original, detach_err
                            );
                        }
                    }
                    self.state = TransactionState::Aborted;
                    return Err(Error::TransactionAborted(format!(
                        "attach of {:#x} failed: {}",
                        request.original, err
                    )));
                }
            }
        }

        let count = applied.len();
        for (request, trampoline) in applied {
            self.registry.entries.insert(
                request.slot,
                HookEntry {
                    slot: request.slot,
                    original: request.original,
                    replacement: request.replacement,
                    trampoline,
                    installed: true,
                },
            );
        }

        self.state = TransactionState::Committed;
        debug!("hook transaction committed ({} entries)", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHookBackend;

    fn five_requests() -> Vec<HookRequest> {
        (1..=5u64)
            .map(|i| HookRequest::function(i * 0x100, i * 0x100 + 1))
            .collect()
    }

    #[test]
    fn test_commit_installs_all_entries() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        for request in five_requests() {
            txn.attach(request).unwrap();
        }
        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        drop(txn);

        assert_eq!(registry.installed_count(), 5);
        for request in five_requests() {
            assert!(registry.is_installed(&request.slot));
            assert_eq!(registry.original(&request.slot), Some(request.original));
        }
    }

    #[test]
    fn test_attach_rejects_null_original() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        let result = txn.attach(HookRequest::function(0, 0xBEEF));
        assert!(matches!(result, Err(Error::HookAttachFailed(_))));
    }

    #[test]
    fn test_attach_rejects_duplicate_slot() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        txn.attach(HookRequest::function(0x100, 0x101)).unwrap();
        let result = txn.attach(HookRequest::function(0x100, 0x102));
        assert!(matches!(result, Err(Error::HookAttachFailed(_))));
    }

    #[test]
    fn test_attach_rejects_already_installed_slot() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        txn.attach(HookRequest::function(0x100, 0x101)).unwrap();
        txn.commit().unwrap();
        drop(txn);

        let mut second = registry.begin_transaction();
        let result = second.attach(HookRequest::function(0x100, 0x102));
        assert!(matches!(result, Err(Error::HookAttachFailed(_))));
    }

    #[test]
    fn test_failed_commit_rolls_back_earlier_entries() {
        let mut backend = MockHookBackend::new();
        backend.fail_attach_at = Some(0x300);

        let mut registry = HookRegistry::new(backend);
        let mut txn = registry.begin_transaction();
        for request in five_requests() {
            txn.attach(request).unwrap();
        }
        let result = txn.commit();
        assert!(matches!(result, Err(Error::TransactionAborted(_))));
        assert_eq!(txn.state(), TransactionState::Aborted);
        drop(txn);

        // Entries #1 and #2 were attached, then detached in reverse order.
        let backend = &registry.backend;
        assert_eq!(backend.attach_log, vec![(0x100, 0x101), (0x200, 0x201)]);
        assert_eq!(backend.detach_log, vec![(0x200, 0x201), (0x100, 0x101)]);
        assert_eq!(backend.active_count(), 0);
        assert_eq!(registry.installed_count(), 0);
    }

    #[test]
    fn test_fresh_transaction_succeeds_after_cause_removed() {
        let mut backend = MockHookBackend::new();
        backend.fail_attach_at = Some(0x300);
        let mut registry = HookRegistry::new(backend);

        let mut txn = registry.begin_transaction();
        for request in five_requests() {
            txn.attach(request).unwrap();
        }
        assert!(txn.commit().is_err());
        drop(txn);

        registry.backend.fail_attach_at = None;

        let mut retry = registry.begin_transaction();
        for request in five_requests() {
            retry.attach(request).unwrap();
        }
        retry.commit().unwrap();
        drop(retry);

        assert_eq!(registry.installed_count(), 5);
        assert_eq!(registry.backend.active_count(), 5);
    }

    #[test]
    fn test_terminated_transaction_rejects_further_use() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        txn.attach(HookRequest::function(0x100, 0x101)).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            txn.attach(HookRequest::function(0x200, 0x201)),
            Err(Error::TransactionAborted(_))
        ));
        assert!(matches!(txn.commit(), Err(Error::TransactionAborted(_))));
    }

    #[test]
    fn test_dropped_transaction_applies_nothing() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        txn.attach(HookRequest::function(0x100, 0x101)).unwrap();
        drop(txn);

        assert_eq!(registry.installed_count(), 0);
        assert!(registry.backend.attach_log.is_empty());
    }

    #[test]
    fn test_dispatch_slots_are_distinct_from_function_slots() {
        let mut registry = HookRegistry::new(MockHookBackend::new());
        let mut txn = registry.begin_transaction();
        txn.attach(HookRequest::function(0x500, 0x501)).unwrap();
        txn.attach(HookRequest::dispatch(0x7000, 14, 0x600, 0x601))
            .unwrap();
        txn.attach(HookRequest::dispatch(0x7000, 15, 0x700, 0x701))
            .unwrap();
        txn.commit().unwrap();
        drop(txn);

        assert_eq!(registry.installed_count(), 3);
        assert_eq!(
            registry.original(&HookSlot::Dispatch {
                table: 0x7000,
                index: 14
            }),
            Some(0x600)
        );
    }
}
