//! Relocatable code stub construction.
//!
//! The multiplier stub reads a floating-point factor through a pointer
//! embedded in its own bytes and multiplies the architecture's current
//! value register by it. Because the stub dereferences the pointer on
//! every invocation, runtime updates to the factor variable take
//! effect without rebuilding or rewriting the stub.

use crate::error::{Error, Result};

/// Length of a near relative call instruction (`E8 rel32`).
pub const CALL_LEN: usize = 5;

const NOP: u8 = 0x90;

/// Pointer width of the instrumented image. The scan, cave and patch
/// logic is shared; only the instruction encodings differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Four,
    Eight,
}

impl PointerWidth {
    pub const fn bytes(self) -> usize {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }

    /// Width of the build target.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::Eight
        } else {
            PointerWidth::Four
        }
    }
}

/// A built multiplier stub: the machine bytes plus the offset of the
/// embedded pointer literal.
#[derive(Debug, Clone)]
pub struct MultiplierStub {
    bytes: Vec<u8>,
    pointer_offset: usize,
}

impl MultiplierStub {
    /// Build the multiply-through-pointer stub with `factor_ptr`
    /// embedded as the load literal.
    pub fn build(width: PointerWidth, factor_ptr: u64) -> Result<Self> {
        match width {
            PointerWidth::Eight => {
                let mut bytes = vec![
                    0x51, // push rcx
                    0x48, 0xB9, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00, // mov rcx, factor_ptr
                    0xF3, 0x0F, 0x10, 0x31, // movss xmm6, [rcx]
                    0xF3, 0x0F, 0x59, 0xC6, // mulss xmm0, xmm6
                    0x59, // pop rcx
                    0xC3, // ret
                ];
                bytes[3..11].copy_from_slice(&factor_ptr.to_le_bytes());
                Ok(Self {
                    bytes,
                    pointer_offset: 3,
                })
            }
            PointerWidth::Four => {
                let literal = u32::try_from(factor_ptr).map_err(|_| Error::PointerTruncated {
                    pointer: factor_ptr,
                    width: 4,
                })?;
                let mut bytes = vec![
                    0x50, // push eax
                    0xB8, 0x00, 0x00, 0x00, 0x00, // mov eax, factor_ptr
                    0xD8, 0x08, // fmul dword ptr [eax]
                    0x58, // pop eax
                    0xC3, // ret
                ];
                bytes[2..6].copy_from_slice(&literal.to_le_bytes());
                Ok(Self {
                    bytes,
                    pointer_offset: 2,
                })
            }
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte offset of the embedded pointer literal.
    pub fn pointer_offset(&self) -> usize {
        self.pointer_offset
    }
}

/// Encode a near relative call from `site` to `target`, padded with
/// NOPs to `patch_len` so the total instruction length at the site is
/// preserved.
///
/// `patch_len` must be at least `CALL_LEN`; it is the length of the
/// instruction(s) being overwritten.
pub fn encode_relative_call(site: u64, target: u64, patch_len: usize) -> Result<Vec<u8>> {
    assert!(patch_len >= CALL_LEN, "patch shorter than a call instruction");

    let displacement = target as i128 - (site as i128 + CALL_LEN as i128);
    let rel32 =
        i32::try_from(displacement).map_err(|_| Error::RelativeCallOutOfRange { site, target })?;

    let mut bytes = Vec::with_capacity(patch_len);
    bytes.push(0xE8);
    bytes.extend_from_slice(&rel32.to_le_bytes());
    bytes.resize(patch_len, NOP);
    Ok(bytes)
}
