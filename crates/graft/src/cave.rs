//! Code-cave location in the tail padding of the code section.
//!
//! The loader maps the code section rounded up to the section
//! alignment, so the span between `virtual_address + virtual_size` and
//! the next section is zero-filled and unused. That predictable
//! location removes the need for a general allocator; nothing else is
//! searched if the tail is occupied.

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::MemoryImage;

/// Section name that denotes executable code in the images this
/// engine targets.
pub const CODE_SECTION: &str = ".text";

/// An unused, zero-filled span inside an executable region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCave {
    pub address: u64,
    pub len: usize,
}

/// Find `min_size` contiguous zero bytes directly after the code
/// section's virtual end.
///
/// Fails with `InsufficientCaveSpace` if any byte in the span is
/// non-zero or the span extends past the image; no other location is
/// considered.
pub fn locate_cave(image: &MemoryImage<'_>, min_size: usize) -> Result<CodeCave> {
    let sections = image.section_table()?;
    let text = sections
        .iter()
        .find(|s| s.name == CODE_SECTION)
        .ok_or_else(|| {
            Error::ModuleInfoUnavailable(format!("no {} section in image", CODE_SECTION))
        })?;

    let end = text.virtual_address as usize + text.virtual_size as usize;
    let span = image
        .bytes()
        .get(end..end + min_size)
        .ok_or(Error::InsufficientCaveSpace { required: min_size })?;

    if let Some(occupied) = span.iter().position(|&b| b != 0) {
        debug!(
            "code section tail occupied at offset {:#x}",
            end + occupied
        );
        return Err(Error::InsufficientCaveSpace { required: min_size });
    }

    let cave = CodeCave {
        address: image.base_address() + end as u64,
        len: min_size,
    };
    debug!("located {}-byte cave at {:#x}", cave.len, cave.address);
    Ok(cave)
}
