//! Call-site patch injection.
//!
//! `PatchInjector` drives the full sequence for one patch: locate a
//! code cave, write the stub into it, scan for every call site, then
//! redirect each site into the stub. Progress is tracked through an
//! explicit phase so a failure leaves an inspectable record of how far
//! the sequence got, and site patching only begins once every site has
//! been found and encoded — a scan miss or an out-of-range call aborts
//! with zero bytes modified.

use tracing::{debug, warn};

use crate::cave::locate_cave;
use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::memory::{PatchMemory, Protection};
use crate::scanner::scan;
use crate::signature::ByteSignature;
use crate::stub::MultiplierStub;

/// One signature that locates call sites, with the offset from the
/// match start to the instruction being replaced.
#[derive(Debug, Clone)]
pub struct CallSitePattern {
    pub signature: ByteSignature,
    pub call_offset: usize,
}

/// Everything one injection needs: the stub to plant, the patterns
/// that find the sites, the exact site count, and how many bytes each
/// site overwrite covers.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub stub: MultiplierStub,
    pub sites: Vec<CallSitePattern>,
    /// The plan is rejected unless the scans find exactly this many
    /// sites in total; more or fewer means the image is not the layout
    /// the plan was written against.
    pub expected_sites: usize,
    pub patch_len: usize,
}

/// Where the injection sequence currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorPhase {
    Idle,
    CaveLocated,
    StubWritten,
    SitesFound,
    SitesPatched,
    Done,
    Failed,
}

/// An encoded site overwrite waiting to be committed, with the bytes
/// the scan snapshot says are currently there.
struct PendingPatch {
    address: u64,
    bytes: Vec<u8>,
    expected: Vec<u8>,
}

/// Single-use driver for one patch plan.
pub struct PatchInjector {
    phase: InjectorPhase,
}

impl Default for PatchInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchInjector {
    pub fn new() -> Self {
        Self {
            phase: InjectorPhase::Idle,
        }
    }

    pub fn phase(&self) -> InjectorPhase {
        self.phase
    }

    /// Run the plan to completion, returning the stub's cave address.
    ///
    /// `image` must be a snapshot of the same address range that
    /// `memory` mutates. An injector is single-use: a second call,
    /// including after a failure, returns `PatchAlreadyApplied`.
    pub fn apply<M: PatchMemory>(
        &mut self,
        memory: &mut M,
        image: &MemoryImage<'_>,
        plan: &PatchPlan,
    ) -> Result<u64> {
        if self.phase != InjectorPhase::Idle {
            return Err(Error::PatchAlreadyApplied);
        }

        match self.run(memory, image, plan) {
            Ok(cave_address) => {
                self.phase = InjectorPhase::Done;
                Ok(cave_address)
            }
            Err(err) => {
                self.phase = InjectorPhase::Failed;
                Err(err)
            }
        }
    }

    fn run<M: PatchMemory>(
        &mut self,
        memory: &mut M,
        image: &MemoryImage<'_>,
        plan: &PatchPlan,
    ) -> Result<u64> {
        let cave = locate_cave(image, plan.stub.len())?;
        self.phase = InjectorPhase::CaveLocated;

        write_protected(memory, cave.address, plan.stub.bytes())?;
        self.phase = InjectorPhase::StubWritten;
        debug!("stub written to cave at {:#x}", cave.address);

        // Per-pattern matches concatenated in declaration order.
        let mut sites = Vec::new();
        for pattern in &plan.sites {
            for address in scan(image, &pattern.signature) {
                sites.push(address + pattern.call_offset as u64);
            }
        }
        if sites.len() != plan.expected_sites {
            return Err(Error::UnexpectedSiteCount {
                expected: plan.expected_sites,
                actual: sites.len(),
            });
        }
        self.phase = InjectorPhase::SitesFound;
        debug!("found {} call site(s)", sites.len());

        // Encode every call before modifying anything, so an
        // out-of-range displacement aborts with the sites untouched.
        let mut patches = Vec::with_capacity(sites.len());
        for &site in &sites {
            let bytes = crate::stub::encode_relative_call(site, cave.address, plan.patch_len)?;
            let offset = (site - image.base_address()) as usize;
            let expected = image
                .bytes()
                .get(offset..offset + plan.patch_len)
                .ok_or(Error::MemoryAccessFailed {
                    address: site,
                    message: "call site past image end".to_string(),
                })?
                .to_vec();
            patches.push(PendingPatch {
                address: site,
                bytes,
                expected,
            });
        }

        for patch in &patches {
            let mut current = vec![0u8; plan.patch_len];
            memory.read(patch.address, &mut current)?;
            if current != patch.expected {
                warn!(
                    "bytes at site {:#x} changed since the scan snapshot",
                    patch.address
                );
            }
            write_protected(memory, patch.address, &patch.bytes)?;
            debug!("patched call site at {:#x}", patch.address);
        }
        self.phase = InjectorPhase::SitesPatched;

        Ok(cave.address)
    }
}

/// Make the range writable, write, restore read+execute, flush.
fn write_protected<M: PatchMemory>(memory: &mut M, address: u64, bytes: &[u8]) -> Result<()> {
    memory.set_protection(address, bytes.len(), Protection::ReadWriteExecute)?;
    memory.write(address, bytes)?;
    memory.set_protection(address, bytes.len(), Protection::ReadExecute)?;
    memory.flush_instruction_cache(address, bytes.len())
}
