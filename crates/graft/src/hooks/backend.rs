//! Live hook backend built on `retour` inline detours.

use std::collections::HashMap;

use retour::RawDetour;

use super::{HookBackend, RawEntryPoint};
use crate::error::{Error, Result};

/// Trampoline-hooking backend for the current process.
///
/// Each attached slot keeps its `RawDetour` alive here; dropping the
/// backend while hooks are attached would unhook them, so the backend
/// lives inside the registry for the process lifetime.
#[derive(Default)]
pub struct DetourBackend {
    active: HashMap<RawEntryPoint, RawDetour>,
}

impl DetourBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HookBackend for DetourBackend {
    fn attach(
        &mut self,
        original: RawEntryPoint,
        replacement: RawEntryPoint,
    ) -> Result<RawEntryPoint> {
        let detour = unsafe { RawDetour::new(original as *const (), replacement as *const ()) }
            .map_err(|e| Error::HookAttachFailed(e.to_string()))?;

        unsafe { detour.enable() }.map_err(|e| Error::HookAttachFailed(e.to_string()))?;

        let trampoline = detour.trampoline() as *const () as RawEntryPoint;
        self.active.insert(original, detour);
        Ok(trampoline)
    }

    fn detach(&mut self, original: RawEntryPoint, _replacement: RawEntryPoint) -> Result<()> {
        let detour = self.active.remove(&original).ok_or_else(|| {
            Error::HookAttachFailed(format!("no active hook at {:#x}", original))
        })?;

        unsafe { detour.disable() }.map_err(|e| Error::HookAttachFailed(e.to_string()))?;
        Ok(())
    }
}
