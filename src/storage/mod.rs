//! On-disk layout and the (piece, offset) to file mapping.
//!
//! The rest of the client thinks in pieces and blocks; this module is the
//! only place that knows those byte ranges land in one or more real files.
//! Failures here are fatal for the torrent that owns the storage.
use crate::metainfo::Metainfo;

use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Range outside torrent data: piece {piece} offset {offset} length {length}")]
    OutOfRange { piece: u32, offset: u32, length: u32 },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One contiguous run of bytes inside a single target file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileSlice {
    /// Index into the torrent's file list.
    pub file: usize,
    /// Byte offset within that file.
    pub offset: u64,
    pub length: u64,
}

struct TargetFile {
    path: PathBuf,
    /// Global offset of this file's first byte within the torrent data.
    start: u64,
    length: u64,
    handle: File,
}

/// Maps logical torrent ranges onto created-on-construction target files.
pub struct Storage {
    root: PathBuf,
    files: Vec<TargetFile>,
    piece_length: u32,
    total_length: u64,
}

/// Reduces a torrent name to `[A-Za-z0-9 ]`, then turns spaces into
/// underscores. An empty result falls back to a fixed name so the
/// directory is always creatable.
fn sanitize_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    let sanitized = kept.replace(' ', "_");
    if sanitized.is_empty() {
        "torrent".to_string()
    } else {
        sanitized
    }
}

/// Picks the first non-existing directory among `name`, `name(1)`,
/// `name(2)`, ...
fn conflict_free_dir(parent: &Path, name: &str) -> PathBuf {
    let mut candidate = parent.join(name);
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = parent.join(format!("{}({})", name, suffix));
        suffix += 1;
    }
    candidate
}

impl Storage {
    /**
    Creates the download directory and every target file for a torrent.

    # How it works:
    1. Derives a conflict-free directory name from the torrent name.
    2. Creates each file (with its parent directories) under it. Files are
       created empty, not pre-allocated; writes land at their final
       offsets later.
    3. Records each file's global start offset so range mapping is a
       simple walk.

    Single-file torrents carry one path-less entry; that file takes the
    sanitized torrent name.
    */
    #[tracing::instrument(level = "debug", skip(metainfo, download_root))]
    pub fn create(metainfo: &Metainfo, download_root: &Path) -> StorageResult<Self> {
        let dir_name = sanitize_name(&metainfo.name);
        let root = conflict_free_dir(download_root, &dir_name);
        fs::create_dir_all(&root)?;
        tracing::info!(dir = %root.display(), "Created download directory");

        let mut files = Vec::with_capacity(metainfo.files.len());
        let mut start = 0u64;
        for entry in &metainfo.files {
            let mut path = root.clone();
            if entry.path.is_empty() {
                path.push(&dir_name);
            } else {
                for component in &entry.path {
                    path.push(component);
                }
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            files.push(TargetFile {
                path,
                start,
                length: entry.length,
                handle,
            });
            start += entry.length;
        }

        Ok(Self {
            root,
            files,
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
        })
    }

    /// The directory all target files live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the target file at `index`.
    pub fn file_path(&self, index: usize) -> &Path {
        &self.files[index].path
    }

    /**
    Maps a logical range onto file segments.

    Returns the ordered list of `(file, file_offset, length)` slices that
    together cover `length` bytes starting at `offset` within `piece`. A
    range may span any number of file boundaries.
    */
    pub fn map_range(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> StorageResult<Vec<FileSlice>> {
        let start =
            u64::from(piece) * u64::from(self.piece_length) + u64::from(offset);
        let end = start + u64::from(length);
        if end > self.total_length {
            return Err(StorageError::OutOfRange { piece, offset, length });
        }

        let mut slices = Vec::new();
        for (index, file) in self.files.iter().enumerate() {
            let file_end = file.start + file.length;
            // Zero-length files occupy no byte range; nothing maps there.
            if file.length == 0 || file_end <= start {
                continue;
            }
            if file.start >= end {
                break;
            }
            let slice_start = start.max(file.start);
            let slice_end = end.min(file_end);
            slices.push(FileSlice {
                file: index,
                offset: slice_start - file.start,
                length: slice_end - slice_start,
            });
        }
        Ok(slices)
    }

    /// Writes a block at its final position, splitting across file
    /// boundaries as needed.
    #[tracing::instrument(level = "trace", skip(self, data))]
    pub fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> StorageResult<()> {
        let slices = self.map_range(piece, offset, data.len() as u32)?;
        let mut consumed = 0usize;
        for slice in slices {
            let file = &mut self.files[slice.file];
            file.handle.seek(SeekFrom::Start(slice.offset))?;
            file.handle
                .write_all(&data[consumed..consumed + slice.length as usize])?;
            consumed += slice.length as usize;
        }
        Ok(())
    }

    /// Reads a block back from its final position.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn read_block(&mut self, piece: u32, offset: u32, length: u32) -> StorageResult<Vec<u8>> {
        let slices = self.map_range(piece, offset, length)?;
        let mut data = vec![0u8; length as usize];
        let mut filled = 0usize;
        for slice in slices {
            let file = &mut self.files[slice.file];
            file.handle.seek(SeekFrom::Start(slice.offset))?;
            file.handle
                .read_exact(&mut data[filled..filled + slice.length as usize])?;
            filled += slice.length as usize;
        }
        Ok(data)
    }
}
