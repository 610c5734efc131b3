//! Reads JIT and dex debug info out of running ART processes.
//!
//! A profiler that samples an Android app needs to know, for every sample
//! landing in JIT-compiled code or a mapped dex file, what that address
//! means. The runtime publishes the answer through two in-process linked
//! lists headed by `__jit_debug_descriptor` and `__dex_debug_descriptor`.
//! This crate polls those lists from outside, over `process_vm_readv`,
//! without ever stopping the target: descriptor seqlocks and structural
//! checks decide what can be trusted, JIT symfiles are copied into
//! append-only scratch files, and the resulting debug-info records are
//! handed to a consumer either immediately or ordered against the kernel
//! sample stream.

pub mod descriptor;
pub mod dex;
pub mod locator;
pub mod process;
pub mod reader;
pub mod remote;
pub mod scratch;
pub mod types;

pub use reader::{
    Config, Delivery, JitDebugReader, ReaderError, SymfilePolicy, MAX_SYMFILE_SIZE, POLL_INTERVAL,
};
pub use remote::{LinuxTarget, TargetAccess};
pub use types::{CodeEntry, DebugInfo, DebugInfoKind, DescriptorKind, Mapping, RecordEvent};
