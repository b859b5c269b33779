//! Memory-protection and raw write primitives behind a trait.
//!
//! `PatchInjector` only touches executable memory through
//! `PatchMemory`, so everything above this seam can be exercised
//! against an in-memory mock. The live Windows implementation wraps
//! `VirtualProtect` and `FlushInstructionCache`.

use crate::error::Result;

/// Protection modes the engine needs. The restore target after a
/// patch is always read+execute, matching the original layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExecute,
    ReadWriteExecute,
}

/// Capability interface for the self-modifying parts of the engine.
pub trait PatchMemory {
    /// Change protection on `[address, address + len)`, returning the
    /// previous mode.
    fn set_protection(&mut self, address: u64, len: usize, protection: Protection)
    -> Result<Protection>;

    /// Read current bytes at `address` into `buf`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `bytes` at `address`. The range must have been made
    /// writable first.
    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Flush the instruction cache for `[address, address + len)`.
    fn flush_instruction_cache(&mut self, address: u64, len: usize) -> Result<()>;
}

#[cfg(target_os = "windows")]
mod live {
    use std::ffi::c_void;

    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    use super::{PatchMemory, Protection};
    use crate::error::{Error, Result};

    /// In-process memory of the host, manipulated directly.
    ///
    /// # Safety contract
    ///
    /// Addresses passed to this implementation must lie inside the
    /// host's mapped image; they come from `locate_cave` and from
    /// signature scans over that image, which guarantees it. Writes
    /// are not synchronized against threads executing the target
    /// bytes; the engine's one-time setup window is responsible for
    /// ensuring none are.
    pub struct LiveMemory;

    impl LiveMemory {
        /// # Safety
        ///
        /// The caller must uphold the address-validity contract above
        /// for every address later passed to the trait methods.
        pub unsafe fn new() -> Self {
            Self
        }
    }

    impl PatchMemory for LiveMemory {
        fn set_protection(
            &mut self,
            address: u64,
            len: usize,
            protection: Protection,
        ) -> Result<Protection> {
            let flags = match protection {
                Protection::ReadExecute => PAGE_EXECUTE_READ,
                Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
            };

            let mut old = PAGE_PROTECTION_FLAGS::default();
            unsafe { VirtualProtect(address as *const c_void, len, flags, &mut old) }.map_err(
                |e| Error::ProtectionChangeFailed {
                    address,
                    message: e.to_string(),
                },
            )?;

            Ok(if old == PAGE_EXECUTE_READWRITE {
                Protection::ReadWriteExecute
            } else {
                Protection::ReadExecute
            })
        }

        fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
            unsafe {
                std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
            }
            Ok(())
        }

        fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
            }
            Ok(())
        }

        fn flush_instruction_cache(&mut self, address: u64, len: usize) -> Result<()> {
            unsafe {
                FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), len)
            }
            .map_err(|e| Error::MemoryAccessFailed {
                address,
                message: e.to_string(),
            })
        }
    }
}

#[cfg(target_os = "windows")]
pub use live::LiveMemory;
