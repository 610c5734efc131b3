use std::path::Path;

/// One mapping of a target process' address space, as read from
/// `/proc/<pid>/maps` (or synthesized in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub len: u64,
    /// File offset the mapping starts at.
    pub pgoff: u64,
    pub exec: bool,
    /// Backing path, or the kernel's bracketed pseudo-name for anonymous
    /// mappings (e.g. `[anon:dalvik-classes.dex extracted in memory from …]`).
    pub name: String,
}

impl Mapping {
    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Which of the two in-target descriptors a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptorKind {
    #[default]
    Jit,
    Dex,
}

/// A new code entry observed in a target's linked list.
///
/// Addresses are in the target's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEntry {
    /// Address of the list node itself.
    pub addr: u64,
    pub symfile_addr: u64,
    pub symfile_size: u64,
    /// CLOCK_MONOTONIC time the target registered the entry.
    pub timestamp: u64,
}

/// A debug-info record delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugInfo {
    pub pid: i32,
    /// Registration time of the code entry this record came from.
    pub timestamp: u64,
    pub kind: DebugInfoKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugInfoKind {
    /// One symbol of a JIT-compiled method, backed by a slice of a scratch
    /// file.
    JitSymbol {
        /// Virtual address of the instruction region described by the
        /// symfile slice.
        vaddr: u64,
        len: u64,
        /// Scratch path annotated with the symfile's byte range, in the form
        /// `<path>:<start>-<end>`. The consumer re-opens the scratch at that
        /// range.
        location: String,
        /// Byte offset of the symfile slice inside the scratch.
        offset: u64,
    },
    /// A dex file resident in the target.
    DexFile {
        /// On-disk path, or a `<apk>!/<entry>` url for dex files extracted
        /// into memory from an apk.
        path: String,
        /// Offset of the dex file within `path`.
        offset: u64,
        /// The target mapping the dex bytes live in, attached when the dex
        /// is not backed by a plain file.
        extracted_mapping: Option<Mapping>,
    },
}

impl DebugInfo {
    /// Path portion of the record, without any `:start-end` annotation.
    pub fn path(&self) -> &Path {
        match &self.kind {
            DebugInfoKind::JitSymbol { location, .. } => {
                let end = location.rfind(':').unwrap_or(location.len());
                Path::new(&location[..end])
            }
            DebugInfoKind::DexFile { path, .. } => Path::new(path),
        }
    }
}

/// Records fed in from the kernel sample stream.
///
/// mmap and mmap2 records both map to [`RecordEvent::Mmap`]; every other
/// record kind the profiler sees collapses to [`RecordEvent::Other`] and
/// only advances the delivery watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Mmap { pid: i32, filename: String, timestamp: u64 },
    Fork { pid: i32, ppid: i32, timestamp: u64 },
    Sample { pid: i32, tid: i32, timestamp: u64 },
    Other { timestamp: u64 },
}

impl RecordEvent {
    pub fn timestamp(&self) -> u64 {
        match *self {
            RecordEvent::Mmap { timestamp, .. }
            | RecordEvent::Fork { timestamp, .. }
            | RecordEvent::Sample { timestamp, .. }
            | RecordEvent::Other { timestamp } => timestamp,
        }
    }
}
