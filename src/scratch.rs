//! Append-only scratch files holding the JIT symfiles read out of targets.
//!
//! Emitted debug-info records point into a scratch with a `path:start-end`
//! slice, so a scratch only ever grows within a run and is flushed after
//! every ingest batch. In drop mode no file is created at all; offsets
//! still advance so the emitted ranges stay meaningful to consumers that
//! only care about address attribution.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    offset: u64,
}

impl ScratchFile {
    /// Create the scratch at `path`, truncating any leftover from an
    /// earlier run. With `drop_contents` the bytes are discarded and only
    /// the offset counter is kept.
    pub fn create(path: PathBuf, drop_contents: bool) -> io::Result<ScratchFile> {
        let writer = if drop_contents {
            None
        } else {
            Some(BufWriter::new(File::create(&path)?))
        };
        debug!(
            "created jit scratch {} (drop_contents={drop_contents})",
            path.display()
        );
        Ok(ScratchFile {
            path,
            writer,
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset the next append will land at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append `bytes`, returning the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let start = self.offset;
        if let Some(writer) = &mut self.writer {
            writer.write_all(bytes)?;
        }
        self.offset += bytes.len() as u64;
        Ok(start)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}
