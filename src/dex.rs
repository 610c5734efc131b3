//! Resolves dex code entries against the target's memory map.
//!
//! A dex entry's symfile range is a dex file resident in target memory.
//! Most are plain file mappings (a `.vdex` or an apk); the interesting case
//! is a dex extracted into an anonymous mapping straight out of an apk,
//! which the kernel names
//! `[anon:dalvik-classes.dex extracted in memory from /data/app/base.apk]`
//! (older devices use an ashmem name instead). Those are reported with a
//! synthetic `<apk>!/<entry>` url plus a snapshot of the mapping.

use std::fs;
use std::path::Path;

use log::{debug, trace};

use crate::types::{CodeEntry, DebugInfo, DebugInfoKind, Mapping};

const EXTRACTED_MARKER: &str = " extracted in memory from ";
const EXTRACTED_PREFIXES: [&str; 3] = ["[anon:dalvik-", "anon:dalvik-", "/dev/ashmem/dalvik-"];

/// Parse an extracted-in-memory dex mapping name into (apk path, entry
/// name).
pub fn parse_extracted_in_memory_path(name: &str) -> Option<(&str, &str)> {
    let rest = EXTRACTED_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))?;
    let (entry, zip) = rest.split_once(EXTRACTED_MARKER)?;
    let zip = zip.strip_suffix(']').unwrap_or(zip);
    let zip = zip.strip_suffix(" (deleted)").unwrap_or(zip);
    (!entry.is_empty() && !zip.is_empty()).then_some((zip, entry))
}

/// Url form for an entry inside a zip archive.
pub fn url_in_apk(zip: &str, entry: &str) -> String {
    format!("{zip}!/{entry}")
}

/// Emit a debug-info record for every dex entry that resolves to a file.
///
/// `maps` must be sorted by start address; each entry's whole
/// `[symfile_addr, symfile_addr + symfile_size)` range has to fall inside
/// one mapping. Dex files living only in anonymous memory (not extracted
/// from an apk) are skipped.
pub fn resolve_dex_entries(
    pid: i32,
    entries: &[CodeEntry],
    maps: &[Mapping],
    out: &mut Vec<DebugInfo>,
) {
    for entry in entries {
        let idx = maps.partition_point(|m| m.start <= entry.symfile_addr);
        if idx == 0 {
            continue;
        }
        let mapping = &maps[idx - 1];
        if mapping.end() < entry.symfile_addr + entry.symfile_size {
            continue;
        }

        let (path, extracted_mapping) =
            if let Some((zip, name)) = parse_extracted_in_memory_path(&mapping.name) {
                (url_in_apk(zip, name), Some(mapping.clone()))
            } else if is_regular_file(&mapping.name) {
                (mapping.name.clone(), None)
            } else {
                debug!(
                    "dex file of pid {pid} at {:#x} lives in unnamed memory, skipped",
                    entry.symfile_addr
                );
                continue;
            };

        // Offset of the dex file in the .vdex or .apk backing the mapping.
        let offset = entry.symfile_addr - mapping.start + mapping.pgoff;
        trace!(
            "dex file {path}+{offset:#x} of pid {pid} in map [{:#x}-{:#x}]",
            mapping.start,
            mapping.end()
        );
        out.push(DebugInfo {
            pid,
            timestamp: entry.timestamp,
            kind: DebugInfoKind::DexFile {
                path,
                offset,
                extracted_mapping,
            },
        });
    }
}

fn is_regular_file(path: &str) -> bool {
    fs::metadata(Path::new(path)).map(|m| m.is_file()).unwrap_or(false)
}
