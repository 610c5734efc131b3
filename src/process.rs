//! Per-target process state.

use crate::descriptor::Descriptor;
use crate::types::DescriptorKind;

/// Library names the runtime publishes its descriptors from.
const RUNTIME_LIB_NAMES: [&str; 2] = ["libart.so", "libartd.so"];

/// Mapping name prefix of the shared zygote JIT code cache.
pub const ZYGOTE_CACHE_MMAP_PREFIX: &str = "/memfd:jit-zygote-cache";

pub fn is_runtime_lib(filename: &str) -> bool {
    RUNTIME_LIB_NAMES.iter().any(|name| filename.ends_with(name))
}

/// State the reader keeps for one monitored process.
///
/// Created on registration; `initialized` flips once the runtime library
/// shows up in the target's maps and the descriptor addresses are known.
/// `died` is set by the first short cross-process read and the record is
/// dropped from the registry after the tick.
#[derive(Debug)]
pub struct Process {
    pub pid: i32,
    pub initialized: bool,
    pub died: bool,
    pub is_64bit: bool,
    /// Descriptor addresses in the target's address space.
    pub jit_descriptor_addr: u64,
    pub dex_descriptor_addr: u64,
    /// Last committed snapshots; entry walks only descend past what these
    /// have already covered.
    pub last_jit_descriptor: Descriptor,
    pub last_dex_descriptor: Descriptor,
    /// Half-open `[start, end)` ranges of shared zygote code caches.
    pub zygote_cache_ranges: Vec<(u64, u64)>,
}

impl Process {
    pub fn new(pid: i32) -> Process {
        Process {
            pid,
            initialized: false,
            died: false,
            is_64bit: false,
            jit_descriptor_addr: 0,
            dex_descriptor_addr: 0,
            last_jit_descriptor: Descriptor::never_seen(DescriptorKind::Jit),
            last_dex_descriptor: Descriptor::never_seen(DescriptorKind::Dex),
            zygote_cache_ranges: Vec::new(),
        }
    }

    pub fn last_descriptor(&self, kind: DescriptorKind) -> &Descriptor {
        match kind {
            DescriptorKind::Jit => &self.last_jit_descriptor,
            DescriptorKind::Dex => &self.last_dex_descriptor,
        }
    }

    pub fn last_descriptor_mut(&mut self, kind: DescriptorKind) -> &mut Descriptor {
        match kind {
            DescriptorKind::Jit => &mut self.last_jit_descriptor,
            DescriptorKind::Dex => &mut self.last_dex_descriptor,
        }
    }

    /// Whether `addr` falls in a shared zygote code cache; such symfiles go
    /// to the zygote scratch so child processes share one artifact.
    pub fn in_zygote_cache(&self, addr: u64) -> bool {
        self.zygote_cache_ranges
            .iter()
            .any(|&(start, end)| addr >= start && addr < end)
    }
}
