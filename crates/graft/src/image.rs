//! Read-only view of a loaded module image.
//!
//! `MemoryImage` is a base address plus a borrowed byte view of the
//! mapped module, used for scanning and section-table inspection. The
//! section table is parsed from the PE headers embedded in the mapped
//! image itself, so the same code path serves live modules and
//! synthetic test buffers.

use tracing::debug;

use crate::error::{Error, Result};

const DOS_MAGIC: u16 = 0x5A4D;
const PE_MAGIC: u32 = 0x0000_4550;
const LFANEW_OFFSET: usize = 0x3C;
const SECTION_HEADER_SIZE: usize = 40;

/// A contiguous mapped region described by base address and size.
pub struct MemoryImage<'a> {
    base: u64,
    bytes: &'a [u8],
}

/// One entry of the image's section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSection {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
}

impl<'a> MemoryImage<'a> {
    pub fn from_parts(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Parse the section table from the mapped PE headers.
    ///
    /// Truncated headers and overlapping virtual ranges are rejected
    /// with `ModuleInfoUnavailable`.
    pub fn section_table(&self) -> Result<Vec<ExecutableSection>> {
        if self.read_u16(0)? != DOS_MAGIC {
            return Err(Error::ModuleInfoUnavailable(
                "missing DOS header magic".to_string(),
            ));
        }

        let pe_offset = self.read_u32(LFANEW_OFFSET)? as usize;
        if self.read_u32(pe_offset)? != PE_MAGIC {
            return Err(Error::ModuleInfoUnavailable(
                "missing PE header magic".to_string(),
            ));
        }

        let section_count = self.read_u16(pe_offset + 6)? as usize;
        let optional_header_size = self.read_u16(pe_offset + 20)? as usize;
        let table_offset = pe_offset + 24 + optional_header_size;

        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let header = table_offset + i * SECTION_HEADER_SIZE;
            let name_bytes = self.read_slice(header, 8)?;
            let name_len = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

            sections.push(ExecutableSection {
                name,
                virtual_size: self.read_u32(header + 8)?,
                virtual_address: self.read_u32(header + 12)?,
            });
        }

        verify_non_overlapping(&sections)?;

        debug!("parsed {} sections from image headers", sections.len());
        Ok(sections)
    }

    fn read_slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| Error::ModuleInfoUnavailable(format!("image truncated at {:#x}", offset)))
    }

    fn read_u16(&self, offset: usize) -> Result<u16> {
        let bytes = self.read_slice(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.read_slice(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn verify_non_overlapping(sections: &[ExecutableSection]) -> Result<()> {
    let mut ranges: Vec<(u64, u64, &str)> = sections
        .iter()
        .map(|s| {
            (
                s.virtual_address as u64,
                s.virtual_address as u64 + s.virtual_size as u64,
                s.name.as_str(),
            )
        })
        .collect();
    ranges.sort_by_key(|r| r.0);

    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(Error::ModuleInfoUnavailable(format!(
                "sections '{}' and '{}' overlap",
                pair[0].2, pair[1].2
            )));
        }
    }
    Ok(())
}

/// Live introspection of the current process's main module.
#[cfg(target_os = "windows")]
pub mod os {
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    use super::MemoryImage;
    use crate::error::{Error, Result};

    /// Borrow the main module of the current process as a `MemoryImage`.
    ///
    /// # Safety
    ///
    /// The returned view aliases live executable memory. The caller
    /// must not hold it across writes performed by other threads, and
    /// writes issued through the engine's own patching path while the
    /// view is alive are an accepted hazard of the one-time setup
    /// window (nothing else may be executing the patched ranges).
    pub unsafe fn current_module_image() -> Result<MemoryImage<'static>> {
        let module = unsafe { GetModuleHandleW(None) }
            .map_err(|e| Error::ModuleInfoUnavailable(e.to_string()))?;

        let mut info = MODULEINFO::default();
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        }
        .map_err(|e| Error::ModuleInfoUnavailable(e.to_string()))?;

        let base = info.lpBaseOfDll as u64;
        let bytes = unsafe {
            std::slice::from_raw_parts(info.lpBaseOfDll as *const u8, info.SizeOfImage as usize)
        };

        Ok(MemoryImage::from_parts(base, bytes))
    }
}
