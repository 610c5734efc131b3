//! Cross-address-space access to monitored targets.
//!
//! Everything the reader learns about a target flows through the
//! [`TargetAccess`] trait: bulk memory reads (process_vm_readv, so the
//! target keeps running) and its current memory map. Tests substitute a
//! synthetic implementation; production uses [`LinuxTarget`].

use std::io::{self, IoSliceMut};

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use procfs::process::MMapPath;

use crate::types::Mapping;

/// Access to a target process' address space and memory map.
pub trait TargetAccess {
    /// Read exactly `buf.len()` bytes at `addr`. A short read is an error;
    /// the caller interprets it as "target exited".
    fn read_exact(&mut self, pid: i32, addr: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Read two ranges in a single vectored call. Used for the descriptor
    /// pair probe, where one syscall instead of two matters at a 100 ms
    /// cadence across many processes.
    fn read_pair(
        &mut self,
        pid: i32,
        first: (u64, &mut [u8]),
        second: (u64, &mut [u8]),
    ) -> io::Result<()>;

    /// The target's current memory map, sorted by start address.
    fn memory_maps(&mut self, pid: i32) -> io::Result<Vec<Mapping>>;
}

/// [`TargetAccess`] over a live Linux system.
#[derive(Debug, Default)]
pub struct LinuxTarget;

impl TargetAccess for LinuxTarget {
    fn read_exact(&mut self, pid: i32, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len();
        let mut local = [IoSliceMut::new(buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        let n = process_vm_readv(Pid::from_raw(pid), &mut local, &remote)
            .map_err(io::Error::from)?;
        if n != len {
            return Err(short_read(n, len));
        }
        Ok(())
    }

    fn read_pair(
        &mut self,
        pid: i32,
        first: (u64, &mut [u8]),
        second: (u64, &mut [u8]),
    ) -> io::Result<()> {
        let total = first.1.len() + second.1.len();
        let remote = [
            RemoteIoVec {
                base: first.0 as usize,
                len: first.1.len(),
            },
            RemoteIoVec {
                base: second.0 as usize,
                len: second.1.len(),
            },
        ];
        let mut local = [IoSliceMut::new(first.1), IoSliceMut::new(second.1)];
        let n = process_vm_readv(Pid::from_raw(pid), &mut local, &remote)
            .map_err(io::Error::from)?;
        if n != total {
            return Err(short_read(n, total));
        }
        Ok(())
    }

    fn memory_maps(&mut self, pid: i32) -> io::Result<Vec<Mapping>> {
        let process = procfs::process::Process::new(pid).map_err(proc_err)?;
        let maps = process.maps().map_err(proc_err)?;
        let mut out: Vec<Mapping> = maps
            .into_iter()
            .map(|m| Mapping {
                start: m.address.0,
                len: m.address.1 - m.address.0,
                pgoff: m.offset,
                exec: &m.perms[2..3] == "x",
                name: mmap_path_name(&m.pathname),
            })
            .collect();
        out.sort_by_key(|m| m.start);
        Ok(out)
    }
}

fn short_read(got: usize, want: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short remote read: {got} of {want} bytes"),
    )
}

fn proc_err(e: procfs::ProcError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn mmap_path_name(path: &MMapPath) -> String {
    match path {
        MMapPath::Path(p) => p.display().to_string(),
        MMapPath::Heap => "[heap]".into(),
        MMapPath::Stack => "[stack]".into(),
        MMapPath::Vdso => "[vdso]".into(),
        MMapPath::Anonymous => String::new(),
        MMapPath::Other(s) => format!("[{s}]"),
        other => format!("[{other:?}]").to_lowercase(),
    }
}
