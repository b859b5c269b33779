//! Signature scanning over a memory image.
//!
//! Simple O(n·m) byte/mask comparison, no instruction semantics. The
//! first non-wildcard signature byte is located with `memchr` to skip
//! impossible window positions.

use memchr::memchr;

use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::signature::ByteSignature;

/// Find every address where `signature` matches inside `image`.
///
/// Returns absolute match addresses in ascending order. An empty
/// result is a valid, non-error outcome; a signature longer than the
/// image yields an empty result rather than an error.
pub fn scan(image: &MemoryImage<'_>, signature: &ByteSignature) -> Vec<u64> {
    let data = image.bytes();
    let len = signature.len();
    if len == 0 || data.len() < len {
        return Vec::new();
    }

    let last = data.len() - len;
    let mut matches = Vec::new();

    match signature.first_fixed() {
        Some((skip, lead)) => {
            let mut start = 0usize;
            while start <= last {
                // Candidate windows place `lead` at window_start + skip.
                let Some(found) = memchr(lead, &data[start + skip..=last + skip]) else {
                    break;
                };
                let offset = start + found;
                if signature.matches_at(&data[offset..offset + len]) {
                    matches.push(image.base_address() + offset as u64);
                }
                start = offset + 1;
            }
        }
        // All-wildcard signature: every window matches.
        None => {
            for offset in 0..=last {
                matches.push(image.base_address() + offset as u64);
            }
        }
    }

    matches
}

/// Find the lowest match for a signature the caller cannot proceed
/// without; `name` identifies it in the error.
pub fn find_first(image: &MemoryImage<'_>, signature: &ByteSignature, name: &str) -> Result<u64> {
    scan(image, signature)
        .first()
        .copied()
        .ok_or_else(|| Error::SignatureNotFound(name.to_string()))
}
