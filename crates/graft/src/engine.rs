//! Top-level instrumentation engine.
//!
//! `Engine` owns the patch memory, the hook registry and the one
//! scroll-patch injector, and sequences initialization: base hooks
//! first, then the optional theme hooks, each as its own transaction
//! so a theme failure never disturbs the base set.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hooks::{HookBackend, HookRegistry, HookRequest};
use crate::image::MemoryImage;
use crate::memory::PatchMemory;
use crate::patch::{CallSitePattern, PatchInjector, PatchPlan};
use crate::signature::ByteSignature;
use crate::stub::{MultiplierStub, PointerWidth};

/// Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Whether the theme hook set is installed at all. Off by default;
    /// the base set alone keeps the host fully functional.
    pub theme_enabled: bool,
    pub width: PointerWidth,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            theme_enabled: false,
            width: PointerWidth::native(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn theme_enabled(mut self, enabled: bool) -> Self {
        self.config.theme_enabled = enabled;
        self
    }

    pub fn width(mut self, width: PointerWidth) -> Self {
        self.config.width = width;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Owner of the instrumentation state for one host process.
pub struct Engine<M: PatchMemory, B: HookBackend> {
    memory: M,
    registry: HookRegistry<B>,
    config: EngineConfig,
    initialized: bool,
    scroll_patch: PatchInjector,
}

impl<M: PatchMemory, B: HookBackend> Engine<M, B> {
    pub fn new(memory: M, backend: B, config: EngineConfig) -> Self {
        Self {
            memory,
            registry: HookRegistry::new(backend),
            config,
            initialized: false,
            scroll_patch: PatchInjector::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HookRegistry<B> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HookRegistry<B> {
        &mut self.registry
    }

    /// Install the startup hook sets. Idempotent: a second call is a
    /// logged no-op.
    ///
    /// The base set must commit for initialization to succeed; the
    /// theme set is attempted only when enabled, in a separate
    /// transaction after the base set is active.
    pub fn initialize(
        &mut self,
        base_hooks: &[HookRequest],
        theme_hooks: &[HookRequest],
    ) -> Result<()> {
        if self.initialized {
            debug!("engine already initialized");
            return Ok(());
        }

        self.install_base_hooks(base_hooks)?;
        self.initialized = true;

        if self.config.theme_enabled {
            self.install_theme_hooks(theme_hooks)?;
        }
        Ok(())
    }

    /// Install the always-on hook set as one all-or-nothing batch.
    pub fn install_base_hooks(&mut self, hooks: &[HookRequest]) -> Result<()> {
        let mut transaction = self.registry.begin_transaction();
        for hook in hooks {
            transaction.attach(*hook)?;
        }
        transaction.commit()?;
        info!("base hook set installed ({} hooks)", hooks.len());
        Ok(())
    }

    /// Install the theme hook set, or skip it entirely when theming is
    /// disabled.
    pub fn install_theme_hooks(&mut self, hooks: &[HookRequest]) -> Result<()> {
        if !self.config.theme_enabled {
            debug!("theming disabled, skipping theme hooks");
            return Ok(());
        }

        let mut transaction = self.registry.begin_transaction();
        for hook in hooks {
            transaction.attach(*hook)?;
        }
        transaction.commit()?;
        info!("theme hook set installed ({} hooks)", hooks.len());
        Ok(())
    }

    /// Plant the scroll-speed multiplier: stub in the code cave, both
    /// wheel-handler call sites redirected into it. Returns the stub
    /// address.
    ///
    /// `image` must snapshot the range this engine's memory mutates.
    pub fn apply_scroll_patch(&mut self, image: &MemoryImage<'_>, factor_ptr: u64) -> Result<u64> {
        let plan = scroll_patch_plan(self.config.width, factor_ptr)?;
        match self.scroll_patch.apply(&mut self.memory, image, &plan) {
            Ok(address) => {
                info!("scroll patch applied, stub at {:#x}", address);
                Ok(address)
            }
            Err(err) => {
                if err.is_scan_failure() {
                    warn!("scroll patch skipped, image layout not recognized: {}", err);
                }
                Err(err)
            }
        }
    }
}

/// The scroll-speed patch plan for a given pointer width.
///
/// Both widths look for the two wheel handlers that scale the scroll
/// delta by a constant: the 8-byte scheme matches the `mulss` against
/// a rip-relative constant (the displacement wildcarded), the 4-byte
/// scheme matches the surrounding x87 load/multiply shape and replaces
/// the `fmul` against the constant. Exactly two sites must exist.
pub fn scroll_patch_plan(width: PointerWidth, factor_ptr: u64) -> Result<PatchPlan> {
    let stub = MultiplierStub::build(width, factor_ptr)?;

    let (sites, patch_len) = match width {
        PointerWidth::Eight => (
            vec![
                CallSitePattern {
                    signature: ByteSignature::from_pattern_mask(
                        &[
                            0xF3, 0x0F, 0x59, 0x05, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x28, 0xF2,
                            0xF3, 0x0F, 0x5C, 0xF0, 0x0F, 0x2F, 0xCE,
                        ],
                        "xxxx????xxxxxxxxxx",
                    )?,
                    call_offset: 0,
                },
                CallSitePattern {
                    signature: ByteSignature::from_pattern_mask(
                        &[
                            0xF3, 0x0F, 0x59, 0x05, 0x00, 0x00, 0x00, 0x00, 0xF3, 0x0F, 0x10,
                            0x94, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x28, 0xF2,
                        ],
                        "xxxx????xxxx?????xxx",
                    )?,
                    call_offset: 0,
                },
            ],
            8,
        ),
        PointerWidth::Four => (
            vec![
                CallSitePattern {
                    signature: ByteSignature::from_pattern_mask(
                        &[0xD9, 0x00, 0x00, 0x00, 0xDB, 0x45, 0x00, 0xDC, 0x0D],
                        "x???xx?xx",
                    )?,
                    call_offset: 7,
                },
                CallSitePattern {
                    signature: ByteSignature::from_pattern_mask(
                        &[
                            0xD9, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xDB, 0x45, 0x00, 0xDC,
                            0x0D,
                        ],
                        "x??????xx?xx",
                    )?,
                    call_offset: 10,
                },
            ],
            6,
        ),
    };

    Ok(PatchPlan {
        stub,
        sites,
        expected_sites: 2,
        patch_len,
    })
}
