//! Unpack an xbstream into a directory.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Read,
    os::unix::fs::FileExt,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, info};

use super::{Chunk, ChunkType, StreamReader};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Verify every chunk's CRC-32 before writing it.
    pub verify_checksums: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

struct OpenEntry {
    file: File,
    offset: u64,
}

fn target_path(target: &Path, chunk: &Chunk, stream_offset: u64) -> Result<PathBuf> {
    let rel = Path::new(&chunk.path);
    let safe = !chunk.path.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(Error::Format {
            what: "xbstream path",
            offset: stream_offset,
            reason: format!("refusing to extract {:?}", chunk.path),
        }
        .into());
    }
    Ok(target.join(rel))
}

fn open_entry(path: &Path) -> Result<OpenEntry> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| Error::FileIo {
            path: path.display().to_string(),
            source,
        })?;
    Ok(OpenEntry { file, offset: 0 })
}

/// Extract every file in the stream below `target`. Returns the paths in the
/// order they first appeared.
pub fn extract<R: Read>(reader: R, target: &Path, opts: &ExtractOptions) -> Result<Vec<String>> {
    let mut stream = StreamReader::new(reader);
    let mut open: HashMap<String, OpenEntry> = HashMap::new();
    let mut seen = Vec::new();

    loop {
        let chunk_start = stream.offset();
        let Some(chunk) = stream.read_chunk()? else {
            break;
        };

        if let ChunkType::Unknown(code) = chunk.chunk_type {
            debug!(code, path = %chunk.path, "skipping ignorable chunk");
            continue;
        }

        if chunk.chunk_type == ChunkType::Eof {
            if open.remove(&chunk.path).is_none() {
                // EOF of an empty file: it still has to exist after extraction.
                let dest = target_path(target, &chunk, chunk_start)?;
                open_entry(&dest)?;
                seen.push(chunk.path.clone());
            }
            continue;
        }

        if opts.verify_checksums {
            chunk.validate_checksum()?;
        }

        if !open.contains_key(&chunk.path) {
            let dest = target_path(target, &chunk, chunk_start)?;
            open.insert(chunk.path.clone(), open_entry(&dest)?);
            seen.push(chunk.path.clone());
        }
        let entry = open
            .get_mut(&chunk.path)
            .ok_or_else(|| Error::Worker(format!("lost open entry for {}", chunk.path)))?;

        if chunk.offset != entry.offset {
            return Err(Error::Format {
                what: "xbstream chunk",
                offset: chunk_start,
                reason: format!(
                    "out-of-order chunk for {}: expected offset {}, got {}",
                    chunk.path, entry.offset, chunk.offset
                ),
            }
            .into());
        }

        match chunk.chunk_type {
            ChunkType::Sparse => {
                let mut pos = chunk.offset;
                let mut data_pos = 0usize;
                for run in &chunk.sparse_map {
                    pos += u64::from(run.skip);
                    let len = run.len as usize;
                    if data_pos + len > chunk.data.len() {
                        return Err(Error::Format {
                            what: "xbstream sparse map",
                            offset: chunk_start,
                            reason: format!("map of {} overruns its payload", chunk.path),
                        }
                        .into());
                    }
                    entry
                        .file
                        .write_all_at(&chunk.data[data_pos..data_pos + len], pos)?;
                    pos += len as u64;
                    data_pos += len;
                }
                if entry.file.metadata()?.len() < pos {
                    entry.file.set_len(pos)?;
                }
                entry.offset = pos;
            }
            _ => {
                entry.file.write_all_at(&chunk.data, chunk.offset)?;
                entry.offset += chunk.data.len() as u64;
            }
        }
    }

    info!(files = seen.len(), target = %target.display(), "xbstream extracted");
    Ok(seen)
}

/// List file paths contained in the stream, in first-appearance order.
pub fn list<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut seen = Vec::new();
    let mut known = std::collections::HashSet::new();
    for chunk in StreamReader::new(reader) {
        let chunk = chunk?;
        if matches!(chunk.chunk_type, ChunkType::Unknown(_)) {
            continue;
        }
        if known.insert(chunk.path.clone()) {
            seen.push(chunk.path);
        }
    }
    Ok(seen)
}
