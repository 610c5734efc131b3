//! The debug-info reader: registry, polling, list walking, delivery.
//!
//! The reader is single-threaded and cooperative. A host event loop calls
//! [`JitDebugReader::poll`] on its timer ticks and
//! [`JitDebugReader::process_record`] for every record it pulls off the
//! kernel sample stream; both may invoke the consumer callback. The target
//! is never stopped, so every tick follows the same
//! validate-walk-revalidate shape: snapshot the descriptors, walk the entry
//! list under structural checks, then re-read the descriptor and commit
//! nothing unless its seqlock held still.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, trace};
use object::{Object, ObjectSymbol};
use thiserror::Error;

use crate::descriptor::{descriptor_size, parse_descriptor, Descriptor, EntryLayout};
use crate::dex::resolve_dex_entries;
use crate::locator::DescriptorLocator;
use crate::process::{is_runtime_lib, Process, ZYGOTE_CACHE_MMAP_PREFIX};
use crate::remote::{LinuxTarget, TargetAccess};
use crate::scratch::ScratchFile;
use crate::types::{CodeEntry, DebugInfo, DebugInfoKind, DescriptorKind, RecordEvent};

/// Checking a pair of descriptors costs a few tens of microseconds of
/// process_vm_readv per process; 100 ms keeps the info fresh without the
/// polling dominating system-wide profiles.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Symfiles above this size are skipped, bounding per-tick read cost.
pub const MAX_SYMFILE_SIZE: u64 = 1024 * 1024;

const APP_SCRATCH_SUFFIX: &str = "jit_app_cache";
const ZYGOTE_SCRATCH_SUFFIX: &str = "jit_zygote_cache";

/// Whether JIT symfile bytes are kept in the scratch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymfilePolicy {
    #[default]
    Retain,
    Drop,
}

/// How debug-info reaches the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Every batch goes to the callback as soon as a tick produced it.
    #[default]
    Immediate,
    /// Records are buffered in a min-heap and released, oldest first, as
    /// the record stream's watermark passes them. The consumer then sees
    /// debug-info for a sample before the sample itself needs symbolizing.
    Ordered,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base path for the scratch artifacts; the reader appends
    /// `_jit_app_cache` / `_jit_zygote_cache`.
    pub scratch_prefix: PathBuf,
    pub symfile_policy: SymfilePolicy,
    pub delivery: Delivery,
}

impl Config {
    pub fn new(scratch_prefix: impl Into<PathBuf>) -> Config {
        Config {
            scratch_prefix: scratch_prefix.into(),
            symfile_policy: SymfilePolicy::default(),
            delivery: Delivery::default(),
        }
    }
}

/// Batch consumer. The flag asks the consumer to flush its buffered sample
/// stream before using the batch; it is set only for periodic-tick batches
/// in immediate delivery. Returning `false` stops the reader.
pub type DebugInfoCallback = Box<dyn FnMut(&[DebugInfo], bool) -> bool>;

/// Fatal reader failures. Everything transient (racing targets, malformed
/// descriptors, vanished processes) is handled inside the tick and only
/// logged.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to write jit scratch file: {0}")]
    Scratch(#[source] io::Error),
    #[error("debug info consumer requested stop")]
    ConsumerAborted,
}

/// Per-tick, per-process failures. These abort work on one process for one
/// tick and are retried on the next; none of them are user-visible.
#[derive(Debug, Error)]
enum TickError {
    #[error("target exited")]
    TargetGone,
    #[error("descriptor failed validation")]
    InvalidDescriptor,
    #[error("runtime library not mapped")]
    RuntimeLibraryMissing,
    #[error("entry list failed consistency checks")]
    BrokenList,
    #[error("descriptor changed during walk")]
    RaceDetected,
}

/// Min-heap adapter ordering debug-info by timestamp.
struct Queued(DebugInfo);

impl PartialEq for Queued {
    fn eq(&self, other: &Queued) -> bool {
        self.0.timestamp == other.0.timestamp
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Queued) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Queued) -> std::cmp::Ordering {
        other.0.timestamp.cmp(&self.0.timestamp)
    }
}

/// Cooperative stand-in for a periodic event-loop timer. Disarmed while a
/// tick runs and whenever the registry is empty.
#[derive(Debug)]
struct PollTimer {
    interval: Duration,
    enabled: bool,
    next_due: Option<Instant>,
}

impl PollTimer {
    fn new(interval: Duration) -> PollTimer {
        PollTimer {
            interval,
            enabled: false,
            next_due: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.enabled && self.next_due.map_or(true, |at| now >= at)
    }

    /// Arm with no deadline: due at the next poll.
    fn wake(&mut self) {
        self.enabled = true;
        self.next_due = None;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn schedule(&mut self, now: Instant) {
        self.enabled = true;
        self.next_due = Some(now + self.interval);
    }
}

/// Reads JIT/dex debug info out of monitored processes.
pub struct JitDebugReader {
    config: Config,
    target: Box<dyn TargetAccess>,
    locator: DescriptorLocator,
    processes: HashMap<i32, Process>,
    /// Pids seen mapping the runtime library; the value flips to true once
    /// the first sample proves the process actually runs and we probe it.
    pids_with_runtime: HashMap<i32, bool>,
    app_scratch: Option<ScratchFile>,
    zygote_scratch: Option<ScratchFile>,
    queue: BinaryHeap<Queued>,
    callback: DebugInfoCallback,
    timer: PollTimer,
}

impl JitDebugReader {
    pub fn new(config: Config, callback: impl FnMut(&[DebugInfo], bool) -> bool + 'static) -> JitDebugReader {
        JitDebugReader::with_target(config, Box::new(LinuxTarget), callback)
    }

    /// Construct against any [`TargetAccess`]; tests drive the reader over
    /// synthetic address spaces this way.
    pub fn with_target(
        config: Config,
        target: Box<dyn TargetAccess>,
        callback: impl FnMut(&[DebugInfo], bool) -> bool + 'static,
    ) -> JitDebugReader {
        JitDebugReader {
            config,
            target,
            locator: DescriptorLocator::new(),
            processes: HashMap::new(),
            pids_with_runtime: HashMap::new(),
            app_scratch: None,
            zygote_scratch: None,
            queue: BinaryHeap::new(),
            callback: Box::new(callback),
            timer: PollTimer::new(POLL_INTERVAL),
        }
    }

    /// Add `pid` to the monitored set. Idempotent; the first addition wakes
    /// the poll timer.
    pub fn monitor(&mut self, pid: i32) {
        if !self.processes.contains_key(&pid) {
            debug!("start monitoring process {pid}");
            self.processes.insert(pid, Process::new(pid));
            if self.processes.len() == 1 {
                self.timer.wake();
            }
        }
    }

    /// Forget `pid` without waiting for it to exit.
    pub fn drop_process(&mut self, pid: i32) {
        if self.processes.remove(&pid).is_some() {
            debug!("stop monitoring process {pid}");
        }
        self.pids_with_runtime.remove(&pid);
    }

    /// Currently monitored pids, in no particular order.
    pub fn monitored(&self) -> impl Iterator<Item = i32> + '_ {
        self.processes.keys().copied()
    }

    /// Whether [`JitDebugReader::poll`] would do work at `now`.
    pub fn poll_due(&self, now: Instant) -> bool {
        self.timer.due(now)
    }

    /// Periodic tick: read every monitored process, deliver what changed,
    /// drop targets that exited. Cheap no-op when the timer is not due.
    pub fn poll(&mut self, now: Instant) -> Result<(), ReaderError> {
        if !self.timer.due(now) {
            return Ok(());
        }
        // Not reentrant: disarm for the duration of the tick.
        self.timer.disable();
        self.read_all_processes()?;
        if !self.processes.is_empty() {
            self.timer.schedule(now);
        }
        Ok(())
    }

    /// Feed one record from the kernel sample stream. Tracks which pids
    /// host the runtime, starts monitoring a pid on its first sample (a
    /// mapped runtime alone is no evidence the process ever runs), and in
    /// ordered delivery releases everything older than this record.
    pub fn process_record(&mut self, record: &RecordEvent) -> Result<(), ReaderError> {
        match record {
            RecordEvent::Mmap { pid, filename, .. } => {
                if is_runtime_lib(filename) {
                    self.pids_with_runtime.entry(*pid).or_insert(false);
                }
            }
            RecordEvent::Fork { pid, ppid, .. } => {
                if pid != ppid && self.pids_with_runtime.contains_key(ppid) {
                    self.pids_with_runtime.entry(*pid).or_insert(false);
                }
            }
            RecordEvent::Sample { pid, .. } => {
                let first_sample = match self.pids_with_runtime.get_mut(pid) {
                    Some(probed) if !*probed => {
                        *probed = true;
                        true
                    }
                    _ => false,
                };
                if first_sample {
                    self.monitor(*pid);
                    self.read_one_process(*pid)?;
                }
            }
            RecordEvent::Other { .. } => {}
        }
        self.flush_debug_info(record.timestamp())
    }

    fn read_all_processes(&mut self) -> Result<(), ReaderError> {
        let pids: Vec<i32> = self.processes.keys().copied().collect();
        let mut batch = Vec::new();
        for pid in pids {
            let Some(mut process) = self.processes.remove(&pid) else {
                continue;
            };
            let result = self.read_process(&mut process, &mut batch);
            if process.died {
                debug!("stop monitoring process {pid}");
            } else {
                self.processes.insert(pid, process);
            }
            result?;
        }
        self.add_debug_info(batch, true)
    }

    /// One-off probe outside the periodic tick (first sample of a pid).
    fn read_one_process(&mut self, pid: i32) -> Result<(), ReaderError> {
        let Some(mut process) = self.processes.remove(&pid) else {
            return Ok(());
        };
        let mut batch = Vec::new();
        let result = self.read_process(&mut process, &mut batch);
        // A died process stays registered until the next tick sweeps it.
        self.processes.insert(pid, process);
        result?;
        self.add_debug_info(batch, false)
    }

    fn read_process(
        &mut self,
        process: &mut Process,
        batch: &mut Vec<DebugInfo>,
    ) -> Result<(), ReaderError> {
        if process.died {
            return Ok(());
        }
        if !process.initialized {
            match self.initialize_process(process) {
                Ok(()) => {}
                Err(e) => {
                    trace!("pid {} not initialized: {e}", process.pid);
                    return Ok(());
                }
            }
        }
        let (jit, dex) = match self.read_descriptors(process) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("pid {}: {e}", process.pid);
                return Ok(());
            }
        };
        if jit.action_seqlock == process.last_jit_descriptor.action_seqlock
            && dex.action_seqlock == process.last_dex_descriptor.action_seqlock
        {
            return Ok(());
        }
        self.read_debug_info(process, jit, batch)?;
        self.read_debug_info(process, dex, batch)
    }

    /// Find the runtime library in the target's maps and derive the
    /// descriptor addresses from its on-disk image.
    fn initialize_process(&mut self, process: &mut Process) -> Result<(), TickError> {
        let maps = match self.target.memory_maps(process.pid) {
            Ok(maps) => maps,
            Err(e) => {
                debug!("failed to read maps of pid {}: {e}", process.pid);
                process.died = true;
                return Err(TickError::TargetGone);
            }
        };
        let (lib_path, base) = maps
            .iter()
            .find(|m| m.exec && is_runtime_lib(&m.name))
            .map(|m| (m.name.clone(), m.start))
            .ok_or(TickError::RuntimeLibraryMissing)?;
        let location = self
            .locator
            .locate(Path::new(&lib_path))
            .ok_or(TickError::RuntimeLibraryMissing)?;

        process.is_64bit = location.is_64bit;
        process.jit_descriptor_addr = location.jit_addr + base;
        process.dex_descriptor_addr = location.dex_addr + base;
        process.zygote_cache_ranges = maps
            .iter()
            .filter(|m| m.name.starts_with(ZYGOTE_CACHE_MMAP_PREFIX))
            .map(|m| (m.start, m.end()))
            .collect();
        process.initialized = true;
        debug!(
            "initialized pid {} from {lib_path}: 64bit={}, jit descriptor at {:#x}, dex at {:#x}",
            process.pid, process.is_64bit, process.jit_descriptor_addr, process.dex_descriptor_addr
        );
        Ok(())
    }

    /// Snapshot both descriptors with a single vectored read.
    fn read_descriptors(
        &mut self,
        process: &mut Process,
    ) -> Result<(Descriptor, Descriptor), TickError> {
        let size = descriptor_size(process.is_64bit);
        let mut jit_raw = vec![0u8; size];
        let mut dex_raw = vec![0u8; size];
        if let Err(e) = self.target.read_pair(
            process.pid,
            (process.jit_descriptor_addr, &mut jit_raw),
            (process.dex_descriptor_addr, &mut dex_raw),
        ) {
            debug!("descriptor read of pid {} failed: {e}", process.pid);
            process.died = true;
            return Err(TickError::TargetGone);
        }
        let jit = parse_descriptor(&jit_raw, process.is_64bit, DescriptorKind::Jit)
            .ok_or(TickError::InvalidDescriptor)?;
        let dex = parse_descriptor(&dex_raw, process.is_64bit, DescriptorKind::Dex)
            .ok_or(TickError::InvalidDescriptor)?;
        Ok((jit, dex))
    }

    /// Walk one descriptor's new entries and emit their debug info.
    /// Commits the snapshot only if the walk survived the re-check.
    fn read_debug_info(
        &mut self,
        process: &mut Process,
        new_descriptor: Descriptor,
        batch: &mut Vec<DebugInfo>,
    ) -> Result<(), ReaderError> {
        let kind = new_descriptor.kind;
        let old = *process.last_descriptor(kind);
        let has_update = new_descriptor.action_seqlock != old.action_seqlock
            && new_descriptor.action_seqlock & 1 == 0;
        debug!(
            "{kind:?} descriptor of pid {}: seqlock {} -> {}",
            process.pid, old.action_seqlock, new_descriptor.action_seqlock
        );
        if !has_update {
            return Ok(());
        }
        // Each add or remove increments the seqlock twice, so the diff
        // bounds how many nodes can have been prepended since `old`.
        let read_entry_limit = new_descriptor
            .action_seqlock
            .wrapping_sub(old.action_seqlock)
            / 2;
        let entries = match self.read_new_entries(
            process,
            &new_descriptor,
            old.action_timestamp,
            read_entry_limit,
        ) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("{kind:?} walk of pid {} aborted: {e}", process.pid);
                return Ok(());
            }
        };
        if let Err(e) = self.check_descriptor_unchanged(process, &new_descriptor) {
            debug!("{kind:?} walk of pid {} discarded: {e}", process.pid);
            return Ok(());
        }
        debug!(
            "{kind:?} walk of pid {}: {} new entries",
            process.pid,
            entries.len()
        );

        if !entries.is_empty() {
            match kind {
                DescriptorKind::Jit => self.read_jit_symfiles(process, &entries, batch)?,
                DescriptorKind::Dex => self.read_dex_files(process, &entries, batch),
            }
        }
        *process.last_descriptor_mut(kind) = new_descriptor;
        Ok(())
    }

    /// Walk the linked list from the head, newest first, collecting
    /// entries registered after `last_action_timestamp`.
    ///
    /// Every hop re-validates structure: the back pointer must name the
    /// node we just came from (zero for the head), the entry fields must
    /// pass the per-version validity predicate, and no node may repeat.
    /// Any violation aborts and discards the whole walk; the list is
    /// mutated by a live process and a next tick gets a fresh view.
    fn read_new_entries(
        &mut self,
        process: &mut Process,
        descriptor: &Descriptor,
        last_action_timestamp: u64,
        read_entry_limit: u32,
    ) -> Result<Vec<CodeEntry>, TickError> {
        let layout = EntryLayout::for_target(descriptor.version, process.is_64bit);
        let mut raw = vec![0u8; layout.size()];
        let mut entries = Vec::new();
        let mut visited = HashSet::new();
        let mut current_addr = descriptor.first_entry_addr;
        let mut prev_addr = 0u64;

        for _ in 0..read_entry_limit {
            if current_addr == 0 {
                break;
            }
            if !visited.insert(current_addr) {
                // Cycle: the list changed under us.
                return Err(TickError::BrokenList);
            }
            self.read_remote(process, current_addr, &mut raw)?;
            let entry = layout.parse(&raw);
            if entry.prev_addr != prev_addr || !entry.valid() {
                return Err(TickError::BrokenList);
            }
            if entry.register_timestamp <= last_action_timestamp {
                // Entries are ordered newest-first; everything from here on
                // was already covered by an earlier walk.
                break;
            }
            entries.push(CodeEntry {
                addr: current_addr,
                symfile_addr: entry.symfile_addr,
                symfile_size: entry.symfile_size,
                timestamp: entry.register_timestamp,
            });
            prev_addr = current_addr;
            current_addr = entry.next_addr;
        }
        Ok(entries)
    }

    /// The post-walk half of validate-walk-revalidate: a seqlock that
    /// moved since the snapshot means the walked list may have been
    /// inconsistent, however plausible it looked.
    fn check_descriptor_unchanged(
        &mut self,
        process: &mut Process,
        snapshot: &Descriptor,
    ) -> Result<(), TickError> {
        let (jit, dex) = self.read_descriptors(process)?;
        let current = match snapshot.kind {
            DescriptorKind::Jit => jit,
            DescriptorKind::Dex => dex,
        };
        if current.action_seqlock != snapshot.action_seqlock {
            return Err(TickError::RaceDetected);
        }
        Ok(())
    }

    /// Pull each new JIT symfile out of the target, append it to the right
    /// scratch, and emit one record per symbol it names.
    fn read_jit_symfiles(
        &mut self,
        process: &mut Process,
        entries: &[CodeEntry],
        batch: &mut Vec<DebugInfo>,
    ) -> Result<(), ReaderError> {
        let mut data = Vec::new();
        for entry in entries {
            if entry.symfile_size > MAX_SYMFILE_SIZE {
                debug!(
                    "skipping {} byte symfile of pid {}",
                    entry.symfile_size, process.pid
                );
                continue;
            }
            let size = entry.symfile_size as usize;
            if data.len() < size {
                data.resize(size, 0);
            }
            if self
                .read_remote(process, entry.symfile_addr, &mut data[..size])
                .is_err()
            {
                continue;
            }
            if !data[..size].starts_with(b"\x7fELF") {
                debug!("symfile of pid {} at {:#x} is not an ELF", process.pid, entry.symfile_addr);
                continue;
            }

            let in_zygote_cache = process.in_zygote_cache(entry.symfile_addr);
            let scratch = scratch_for(
                &self.config,
                &mut self.app_scratch,
                &mut self.zygote_scratch,
                in_zygote_cache,
            )
            .map_err(ReaderError::Scratch)?;
            let offset = scratch.append(&data[..size]).map_err(ReaderError::Scratch)?;
            // The consumer re-opens the scratch at exactly this slice.
            let location = format!(
                "{}:{}-{}",
                scratch.path().display(),
                offset,
                offset + entry.symfile_size
            );

            let Ok(symfile) = object::File::parse(&data[..size]) else {
                continue;
            };
            for symbol in symfile.symbols() {
                if symbol.size() == 0 {
                    // Some arm labels parse as zero-length symbols.
                    continue;
                }
                trace!(
                    "jit symbol {:?} at [{:#x}-{:#x}) in {location}",
                    symbol.name().unwrap_or(""),
                    symbol.address(),
                    symbol.address() + symbol.size()
                );
                batch.push(DebugInfo {
                    pid: process.pid,
                    timestamp: entry.timestamp,
                    kind: DebugInfoKind::JitSymbol {
                        vaddr: symbol.address(),
                        len: symbol.size(),
                        location: location.clone(),
                        offset,
                    },
                });
            }
        }

        for scratch in [&mut self.app_scratch, &mut self.zygote_scratch] {
            if let Some(scratch) = scratch {
                scratch.flush().map_err(ReaderError::Scratch)?;
            }
        }
        Ok(())
    }

    fn read_dex_files(
        &mut self,
        process: &mut Process,
        entries: &[CodeEntry],
        batch: &mut Vec<DebugInfo>,
    ) {
        let maps = match self.target.memory_maps(process.pid) {
            Ok(maps) => maps,
            Err(e) => {
                debug!("failed to read maps of pid {}: {e}", process.pid);
                process.died = true;
                return;
            }
        };
        resolve_dex_entries(process.pid, entries, &maps, batch);
    }

    fn read_remote(
        &mut self,
        process: &mut Process,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<(), TickError> {
        if let Err(e) = self.target.read_exact(process.pid, addr, buf) {
            debug!(
                "remote read of {} bytes at {:#x} from pid {} failed: {e}",
                buf.len(),
                addr,
                process.pid
            );
            process.died = true;
            return Err(TickError::TargetGone);
        }
        Ok(())
    }

    fn add_debug_info(
        &mut self,
        batch: Vec<DebugInfo>,
        sync_with_kernel_records: bool,
    ) -> Result<(), ReaderError> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.config.delivery {
            Delivery::Ordered => {
                for info in batch {
                    self.queue.push(Queued(info));
                }
                Ok(())
            }
            Delivery::Immediate => self.deliver(&batch, sync_with_kernel_records),
        }
    }

    /// Release buffered debug-info older than `watermark` as one batch.
    fn flush_debug_info(&mut self, watermark: u64) -> Result<(), ReaderError> {
        if self.config.delivery != Delivery::Ordered {
            return Ok(());
        }
        let mut batch = Vec::new();
        loop {
            match self.queue.peek() {
                Some(queued) if queued.0.timestamp < watermark => {}
                _ => break,
            }
            if let Some(queued) = self.queue.pop() {
                batch.push(queued.0);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.deliver(&batch, false)
    }

    fn deliver(&mut self, batch: &[DebugInfo], sync_with_kernel_records: bool) -> Result<(), ReaderError> {
        if (self.callback)(batch, sync_with_kernel_records) {
            Ok(())
        } else {
            Err(ReaderError::ConsumerAborted)
        }
    }
}

/// Lazily create and hand out the scratch a symfile belongs in. Free
/// function so the borrow stays scoped to the scratch slots.
fn scratch_for<'a>(
    config: &Config,
    app: &'a mut Option<ScratchFile>,
    zygote: &'a mut Option<ScratchFile>,
    in_zygote_cache: bool,
) -> io::Result<&'a mut ScratchFile> {
    let (slot, suffix) = if in_zygote_cache {
        (zygote, ZYGOTE_SCRATCH_SUFFIX)
    } else {
        (app, APP_SCRATCH_SUFFIX)
    };
    if slot.is_none() {
        let mut path = config.scratch_prefix.clone().into_os_string();
        path.push(format!("_{suffix}"));
        *slot = Some(ScratchFile::create(
            PathBuf::from(path),
            config.symfile_policy == SymfilePolicy::Drop,
        )?);
    }
    match slot.as_mut() {
        Some(scratch) => Ok(scratch),
        None => unreachable!("scratch was just created"),
    }
}
