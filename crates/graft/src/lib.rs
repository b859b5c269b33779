//! Runtime binary-instrumentation engine for patching a host process
//! in place.
//!
//! Provides:
//! - wildcard byte-signature scanning over a mapped image
//! - executable-region discovery from the image's section table, with
//!   code-cave location in the code section's tail padding
//! - relocatable multiplier-stub construction for two pointer widths
//! - all-or-nothing call-site patch injection
//! - transactional hook installation with rollback
//! - lazy, exactly-once dispatch-table method hooking
//!
//! Everything above the `PatchMemory`, `HookBackend` and `ReadWord`
//! seams is platform-neutral and testable in isolation; the live
//! Windows implementations sit behind `cfg(target_os = "windows")`.

pub mod cave;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod image;
pub mod memory;
pub mod patch;
pub mod scanner;
pub mod signature;
pub mod stub;

#[cfg(test)]
pub(crate) mod mock;

pub use cave::{CODE_SECTION, CodeCave, locate_cave};
pub use dispatch::{
    CapabilitySlot, ChainStage, DispatchChain, DispatchTableHookResolver, MethodHook, ReadWord,
    ResolvedMethod,
};
pub use engine::{Engine, EngineConfig, EngineConfigBuilder, scroll_patch_plan};
pub use error::{Error, Result};
pub use hooks::{
    HookBackend, HookEntry, HookRegistry, HookRequest, HookSlot, HookTransaction, RawEntryPoint,
    TransactionState,
};
pub use image::{ExecutableSection, MemoryImage};
pub use memory::{PatchMemory, Protection};
pub use patch::{CallSitePattern, InjectorPhase, PatchInjector, PatchPlan};
pub use scanner::{find_first, scan};
pub use signature::{ByteSignature, SignatureEntry, SignatureSet, load_signatures, save_signatures};
pub use stub::{CALL_LEN, MultiplierStub, PointerWidth, encode_relative_call};

#[cfg(target_os = "windows")]
pub use dispatch::os::LiveWordReader;
#[cfg(target_os = "windows")]
pub use hooks::DetourBackend;
#[cfg(target_os = "windows")]
pub use image::os::current_module_image;
#[cfg(target_os = "windows")]
pub use memory::LiveMemory;
