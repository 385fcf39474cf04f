// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Append-only, memory-mapped storage for raw vector payloads.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (64 bytes)                            │
//! │ - magic: u32 ("SIVS")                        │
//! │ - version: u16                               │
//! │ - reserved: u16                              │
//! │ - write_offset: u64 (checkpointed tail)      │
//! │ - reserved: [u8; 48]                         │
//! ├──────────────────────────────────────────────┤
//! │ [magic u32][len u32][crc32 u32][payload]     │
//! │ [magic u32][len u32][crc32 u32][payload]     │
//! │ ...                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Records are never rewritten. The header's write offset is checkpointed on
//! [`VectorStore::flush`]; on open, any valid records appended after the last
//! checkpoint are recovered by walking forward from it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{IvfError, Result};

/// Magic number for vector store files.
const STORE_MAGIC: u32 = 0x5356_4953; // "SIVS"

/// Magic number prefixing every record.
const RECORD_MAGIC: u32 = 0x4345_5256; // "VREC"

/// Current file format version.
const STORE_VERSION: u16 = 1;

/// File header size in bytes.
const HEADER_SIZE: usize = 64;

/// Record header size: magic + len + crc.
pub(crate) const RECORD_HEADER_SIZE: usize = 12;

/// Initial file size.
const INITIAL_SIZE: usize = 1024 * 1024;

struct StoreInner {
    mmap: MmapMut,
    file: File,
    write_offset: u64,
}

/// Outcome of a full [`VectorStore::scan`].
#[derive(Debug, Default)]
pub struct ScanReport {
    /// `(offset, payload_len)` of every record that validated.
    pub records: Vec<(u64, u32)>,
    /// Records that failed validation, as `StorageCorruption` errors.
    pub corrupt: Vec<IvfError>,
}

/// I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records appended since open.
    pub appends: u64,
    /// Records read since open.
    pub reads: u64,
    /// Checkpoints written since open.
    pub flushes: u64,
    /// Bytes used by records and header.
    pub used_bytes: u64,
}

/// Append-only record log backed by a memory map.
///
/// Appends take an exclusive lock; reads share a read lock and copy the
/// payload out, so a read never observes a remap in progress.
pub struct VectorStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
    appends: AtomicU64,
    reads: AtomicU64,
    flushes: AtomicU64,
}

impl VectorStore {
    /// Opens the store at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// * `IvfError::CorruptedIndex` - If the file header is invalid
    /// * `IvfError::Io` - If file operations fail
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current_size = file.metadata()?.len() as usize;
        if current_size < INITIAL_SIZE {
            file.set_len(INITIAL_SIZE as u64)?;
        }

        // SAFETY: the file is owned by this store for its lifetime and is only
        // resized while the exclusive lock is held.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut inner = StoreInner {
            mmap,
            file,
            write_offset: HEADER_SIZE as u64,
        };

        if exists && current_size >= HEADER_SIZE {
            let checkpoint = read_header(&inner.mmap)?;
            let (tail, recovered) = recover_tail(&inner.mmap, checkpoint);
            inner.write_offset = tail;
            info!(
                path = %path.display(),
                checkpoint,
                tail,
                recovered,
                "opened vector store"
            );
        } else {
            write_header(&mut inner.mmap, HEADER_SIZE as u64);
            debug!(path = %path.display(), "created vector store");
        }

        Ok(Self {
            path,
            inner: RwLock::new(inner),
            appends: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bytes` as one record and returns the record's offset.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            IvfError::InvalidConfig(format!("record of {} bytes is too large", bytes.len()))
        })?;
        let crc = crc32fast::hash(bytes);
        let entry_size = RECORD_HEADER_SIZE + bytes.len();

        let mut inner = self.inner.write();
        let offset = inner.write_offset;
        let start = offset as usize;
        if start + entry_size > inner.mmap.len() {
            grow(&mut inner, entry_size)?;
        }

        let mmap = &mut inner.mmap;
        mmap[start..start + 4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        mmap[start + 4..start + 8].copy_from_slice(&len.to_le_bytes());
        mmap[start + 8..start + 12].copy_from_slice(&crc.to_le_bytes());
        mmap[start + RECORD_HEADER_SIZE..start + entry_size].copy_from_slice(bytes);

        inner.write_offset = offset + entry_size as u64;
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(offset)
    }

    /// Reads the record at `offset`, checking it declares exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// * `IvfError::StorageCorruption` - If the length or checksum does not match
    pub fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let (declared, payload) = validate_record(&inner.mmap, offset, inner.write_offset)?;
        if declared != len {
            return Err(IvfError::corruption(
                offset,
                format!("declared length {declared} but caller expected {len}"),
            ));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(payload.to_vec())
    }

    /// Reads the record at `offset` using its own declared length.
    pub fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let (_, payload) = validate_record(&inner.mmap, offset, inner.write_offset)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(payload.to_vec())
    }

    /// Walks every record, skipping and reporting damaged ones.
    ///
    /// After a record whose header is unusable, the scan resynchronises on the
    /// next occurrence of the record magic.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn scan(&self) -> ScanReport {
        let inner = self.inner.read();
        let end = inner.write_offset;
        let mut report = ScanReport::default();
        let mut offset = HEADER_SIZE as u64;

        while offset + RECORD_HEADER_SIZE as u64 <= end {
            match validate_record(&inner.mmap, offset, end) {
                Ok((len, _)) => {
                    report.records.push((offset, len));
                    offset += (RECORD_HEADER_SIZE + len as usize) as u64;
                }
                Err(err) => {
                    warn!(offset, error = %err, "skipping corrupt record");
                    report.corrupt.push(err);
                    match find_magic(&inner.mmap, offset + 1, end) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
            }
        }

        debug!(
            valid = report.records.len(),
            corrupt = report.corrupt.len(),
            "scan complete"
        );
        report
    }

    /// Checkpoints the write offset and msyncs the map.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let tail = inner.write_offset;
        write_header(&mut inner.mmap, tail);
        inner.mmap.flush()?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// I/O counters since open.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            appends: self.appends.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            used_bytes: self.inner.read().write_offset,
        }
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to checkpoint vector store on drop");
        }
    }
}

fn write_header(mmap: &mut MmapMut, write_offset: u64) {
    let header = &mut mmap[0..HEADER_SIZE];
    header[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&STORE_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&write_offset.to_le_bytes());
}

/// Validates the header and returns the checkpointed write offset.
fn read_header(mmap: &[u8]) -> Result<u64> {
    let magic = read_u32(mmap, 0);
    if magic != STORE_MAGIC {
        return Err(IvfError::CorruptedIndex(
            "Invalid vector store magic".to_string(),
        ));
    }
    let version = u16::from_le_bytes([mmap[4], mmap[5]]);
    if version != STORE_VERSION {
        return Err(IvfError::CorruptedIndex(format!(
            "Unsupported vector store version: {version}"
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&mmap[8..16]);
    let offset = u64::from_le_bytes(buf);
    if offset < HEADER_SIZE as u64 || offset > mmap.len() as u64 {
        return Err(IvfError::CorruptedIndex(format!(
            "write offset {offset} outside file"
        )));
    }
    Ok(offset)
}

/// Walks forward from the checkpoint over records that validate and returns
/// the recovered tail and how many records were found past the checkpoint.
fn recover_tail(mmap: &[u8], checkpoint: u64) -> (u64, usize) {
    let end = mmap.len() as u64;
    let mut offset = checkpoint;
    let mut recovered = 0;
    while let Ok((len, _)) = validate_record(mmap, offset, end) {
        offset += (RECORD_HEADER_SIZE + len as usize) as u64;
        recovered += 1;
    }
    (offset, recovered)
}

/// Checks the record at `offset` and returns its declared length and payload.
fn validate_record(mmap: &[u8], offset: u64, end: u64) -> Result<(u32, &[u8])> {
    if offset < HEADER_SIZE as u64 || offset + RECORD_HEADER_SIZE as u64 > end {
        return Err(IvfError::corruption(offset, "offset outside written region"));
    }
    let start = offset as usize;
    if read_u32(mmap, start) != RECORD_MAGIC {
        return Err(IvfError::corruption(offset, "bad record magic"));
    }
    let len = read_u32(mmap, start + 4);
    let crc = read_u32(mmap, start + 8);
    let payload_start = start + RECORD_HEADER_SIZE;
    let payload_end = payload_start as u64 + len as u64;
    if payload_end > end {
        return Err(IvfError::corruption(
            offset,
            format!("declared length {len} runs past end of log"),
        ));
    }
    let payload = &mmap[payload_start..payload_end as usize];
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(IvfError::corruption(
            offset,
            format!("checksum mismatch: stored {crc:#010x}, computed {actual:#010x}"),
        ));
    }
    Ok((len, payload))
}

fn find_magic(mmap: &[u8], from: u64, end: u64) -> Option<u64> {
    let needle = RECORD_MAGIC.to_le_bytes();
    let from = from as usize;
    let end = end as usize;
    if from + 4 > end {
        return None;
    }
    mmap[from..end]
        .windows(4)
        .position(|w| w == needle)
        .map(|pos| (from + pos) as u64)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn grow(inner: &mut StoreInner, additional: usize) -> Result<()> {
    let current = inner.mmap.len();
    let required = inner.write_offset as usize + additional;
    let new_size = (current * 2).max(required + INITIAL_SIZE);

    inner.mmap.flush()?;
    inner.file.set_len(new_size as u64)?;
    // SAFETY: exclusive lock held by caller; the old map is dropped on assignment.
    inner.mmap = unsafe { MmapMut::map_mut(&inner.file)? };
    debug!(from = current, to = new_size, "grew vector store");
    Ok(())
}
