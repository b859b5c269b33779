//! Test doubles for the engine's capability seams.
//!
//! Provides an in-memory `PatchMemory`, a recording `HookBackend`, a
//! map-backed `ReadWord` and a synthetic PE image builder, so every
//! component can be exercised without touching live executable memory.

use std::collections::{HashMap, HashSet};

use crate::dispatch::ReadWord;
use crate::error::{Error, Result};
use crate::hooks::HookBackend;
use crate::memory::{PatchMemory, Protection};
use crate::stub::PointerWidth;

/// Build a minimal mapped PE image with the given `(name, virtual
/// address, virtual size)` sections, zero-filled elsewhere.
pub fn build_pe_image(total_size: usize, sections: &[(&str, u32, u32)]) -> Vec<u8> {
    const PE_OFFSET: usize = 0x80;
    const OPT_HEADER_SIZE: usize = 0xF0;
    let table = PE_OFFSET + 24 + OPT_HEADER_SIZE;
    assert!(
        total_size >= table + sections.len() * 40,
        "image too small for section table"
    );

    let mut data = vec![0u8; total_size];
    data[0] = b'M';
    data[1] = b'Z';
    data[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
    data[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
    data[PE_OFFSET + 6..PE_OFFSET + 8].copy_from_slice(&(sections.len() as u16).to_le_bytes());
    data[PE_OFFSET + 20..PE_OFFSET + 22]
        .copy_from_slice(&(OPT_HEADER_SIZE as u16).to_le_bytes());

    for (i, (name, va, vsize)) in sections.iter().enumerate() {
        let header = table + i * 40;
        assert!(name.len() <= 8);
        data[header..header + name.len()].copy_from_slice(name.as_bytes());
        data[header + 8..header + 12].copy_from_slice(&vsize.to_le_bytes());
        data[header + 12..header + 16].copy_from_slice(&va.to_le_bytes());
    }

    data
}

/// `PatchMemory` over an owned buffer, recording every protection and
/// flush call and optionally failing protection changes at one
/// address.
pub struct MockPatchMemory {
    base: u64,
    data: Vec<u8>,
    pub protection_calls: Vec<(u64, usize, Protection)>,
    pub flush_calls: Vec<(u64, usize)>,
    pub fail_protect_at: Option<u64>,
}

impl MockPatchMemory {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self {
            base,
            data,
            protection_calls: Vec::new(),
            flush_calls: Vec::new(),
            fail_protect_at: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn slice(&self, address: u64, len: usize) -> &[u8] {
        let offset = (address - self.base) as usize;
        &self.data[offset..offset + len]
    }

    fn offset(&self, address: u64, len: usize) -> Result<usize> {
        let offset = address
            .checked_sub(self.base)
            .ok_or(Error::MemoryAccessFailed {
                address,
                message: "below image base".to_string(),
            })? as usize;
        if offset + len > self.data.len() {
            return Err(Error::MemoryAccessFailed {
                address,
                message: "past image end".to_string(),
            });
        }
        Ok(offset)
    }
}

impl PatchMemory for MockPatchMemory {
    fn set_protection(
        &mut self,
        address: u64,
        len: usize,
        protection: Protection,
    ) -> Result<Protection> {
        if self.fail_protect_at == Some(address) {
            return Err(Error::ProtectionChangeFailed {
                address,
                message: "injected failure".to_string(),
            });
        }
        self.protection_calls.push((address, len, protection));
        Ok(Protection::ReadExecute)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset(address, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let offset = self.offset(address, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush_instruction_cache(&mut self, address: u64, len: usize) -> Result<()> {
        self.flush_calls.push((address, len));
        Ok(())
    }
}

/// Recording `HookBackend` with an injectable attach failure. The
/// trampoline it hands back is the original entry point itself.
#[derive(Default)]
pub struct MockHookBackend {
    pub attach_log: Vec<(u64, u64)>,
    pub detach_log: Vec<(u64, u64)>,
    pub fail_attach_at: Option<u64>,
    active: HashSet<u64>,
}

impl MockHookBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, original: u64) -> bool {
        self.active.contains(&original)
    }
}

impl HookBackend for MockHookBackend {
    fn attach(&mut self, original: u64, replacement: u64) -> Result<u64> {
        if self.fail_attach_at == Some(original) {
            return Err(Error::HookAttachFailed(format!(
                "injected failure at {:#x}",
                original
            )));
        }
        self.attach_log.push((original, replacement));
        self.active.insert(original);
        Ok(original)
    }

    fn detach(&mut self, original: u64, replacement: u64) -> Result<()> {
        self.detach_log.push((original, replacement));
        self.active.remove(&original);
        Ok(())
    }
}

/// Map-backed `ReadWord` for dispatch-table tests.
pub struct MockWordReader {
    width: PointerWidth,
    words: HashMap<u64, u64>,
}

impl MockWordReader {
    pub fn new(width: PointerWidth) -> Self {
        Self {
            width,
            words: HashMap::new(),
        }
    }

    pub fn set_word(&mut self, address: u64, value: u64) {
        self.words.insert(address, value);
    }

    /// Wire up an instance whose first word points at `table`.
    pub fn add_instance(&mut self, instance: u64, table: u64) {
        self.set_word(instance, table);
    }

    /// Place a method entry at `table[index]`.
    pub fn set_method(&mut self, table: u64, index: usize, entry: u64) {
        self.set_word(table + (index * self.width.bytes()) as u64, entry);
    }
}

impl ReadWord for MockWordReader {
    fn width(&self) -> PointerWidth {
        self.width
    }

    fn read_word(&self, address: u64) -> Result<u64> {
        self.words
            .get(&address)
            .copied()
            .ok_or(Error::MemoryAccessFailed {
                address,
                message: "unmapped word".to_string(),
            })
    }
}
