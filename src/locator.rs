//! Finds the debug descriptors inside the runtime library image.
//!
//! The descriptor addresses are per-library, not per-process: the dynamic
//! linker maps the library from the page-aligned start of its first
//! executable segment, so `symbol_vaddr - page_align(min_exec_vaddr)` is an
//! offset that, added to the in-memory base of any process that mapped the
//! same file, lands on the live descriptor. Results are cached per path and
//! never invalidated; libraries do not relocate within a process lifetime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::unistd::{sysconf, SysconfVar};
use object::{Object, ObjectSegment, ObjectSymbol, SegmentFlags};

const JIT_DESCRIPTOR_SYMBOL: &str = "__jit_debug_descriptor";
const DEX_DESCRIPTOR_SYMBOL: &str = "__dex_debug_descriptor";

/// Where the two descriptors live relative to a library's in-memory base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorsLocation {
    pub is_64bit: bool,
    /// Zero encodes a negative cache entry (library lacks the descriptors).
    pub jit_addr: u64,
    pub dex_addr: u64,
}

/// Per-path descriptor location cache.
#[derive(Debug, Default)]
pub struct DescriptorLocator {
    cache: HashMap<PathBuf, DescriptorsLocation>,
}

impl DescriptorLocator {
    pub fn new() -> DescriptorLocator {
        DescriptorLocator::default()
    }

    /// Locate the descriptors in the library at `path`, reading the ELF at
    /// most once per path. `None` means the library has no descriptors (or
    /// could not be parsed); that answer is cached too.
    pub fn locate(&mut self, path: &Path) -> Option<DescriptorsLocation> {
        let entry = self
            .cache
            .entry(path.to_path_buf())
            .or_insert_with(|| match locate_in_file(path) {
                Some(location) => location,
                None => {
                    debug!("no debug descriptors in {}", path.display());
                    DescriptorsLocation::default()
                }
            });
        (entry.jit_addr != 0).then_some(*entry)
    }
}

fn locate_in_file(path: &Path) -> Option<DescriptorsLocation> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to read runtime library {}: {e}", path.display());
            return None;
        }
    };
    let file = match object::File::parse(&*data) {
        Ok(file) => file,
        Err(e) => {
            warn!("failed to parse runtime library {}: {e}", path.display());
            return None;
        }
    };

    // The linker maps from the page-aligned segment start, not from the
    // segment's exact p_vaddr.
    let page_mask = !(page_size() - 1);
    let min_exec_vaddr = file
        .segments()
        .filter(|s| is_executable(s.flags()))
        .map(|s| s.address())
        .min()
        .unwrap_or(0);
    let aligned_segment_vaddr = min_exec_vaddr & page_mask;

    let (mut jit_addr, mut dex_addr) = scan_symbols(file.dynamic_symbols(), aligned_segment_vaddr);
    if jit_addr == 0 || dex_addr == 0 {
        // Debug builds of the runtime keep the descriptors in .symtab only.
        let (jit, dex) = scan_symbols(file.symbols(), aligned_segment_vaddr);
        if jit_addr == 0 {
            jit_addr = jit;
        }
        if dex_addr == 0 {
            dex_addr = dex;
        }
    }

    (jit_addr != 0 && dex_addr != 0).then(|| DescriptorsLocation {
        is_64bit: file.is_64(),
        jit_addr,
        dex_addr,
    })
}

fn scan_symbols<'data, S>(symbols: impl Iterator<Item = S>, aligned_segment_vaddr: u64) -> (u64, u64)
where
    S: ObjectSymbol<'data>,
{
    let (mut jit_addr, mut dex_addr) = (0u64, 0u64);
    for symbol in symbols {
        if let Ok(name) = symbol.name() {
            match name {
                JIT_DESCRIPTOR_SYMBOL => jit_addr = symbol.address().wrapping_sub(aligned_segment_vaddr),
                DEX_DESCRIPTOR_SYMBOL => dex_addr = symbol.address().wrapping_sub(aligned_segment_vaddr),
                _ => {}
            }
        }
    }
    (jit_addr, dex_addr)
}

fn is_executable(flags: SegmentFlags) -> bool {
    match flags {
        SegmentFlags::Elf { p_flags } => p_flags & object::elf::PF_X != 0,
        _ => false,
    }
}

fn page_size() -> u64 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|sz| sz as u64)
        .unwrap_or(4096)
}
