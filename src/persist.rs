// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Checksummed single-object files with atomic replacement.
//!
//! Layout: `[magic: 4][version: u16][body_len: u64][bincode body][crc32: u32]`.
//! The checksum covers the body only. Writes go to a sibling temp file that is
//! renamed over the destination, so readers see either the old or the new file.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{IvfError, Result};

const PREFIX_LEN: usize = 4 + 2 + 8;

/// Serializes `value` and atomically replaces `path` with it.
pub(crate) fn write_atomic<T: Serialize>(
    path: &Path,
    magic: &[u8; 4],
    version: u16,
    value: &T,
    sync: bool,
) -> Result<()> {
    let body = bincode::serialize(value)?;
    let crc = crc32fast::hash(&body);

    let tmp = temp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(magic)?;
        writer.write_all(&version.to_le_bytes())?;
        writer.write_all(&(body.len() as u64).to_le_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
    }
    atomic_replace(&tmp, path)?;
    Ok(())
}

/// Reads and validates a file written by [`write_atomic`].
pub(crate) fn read_checked<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 4],
    version: u16,
) -> Result<T> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let name = path.display();

    if bytes.len() < PREFIX_LEN + 4 || &bytes[0..4] != magic {
        return Err(IvfError::CorruptedIndex(format!(
            "{name}: invalid magic bytes"
        )));
    }
    let found = u16::from_le_bytes([bytes[4], bytes[5]]);
    if found != version {
        return Err(IvfError::CorruptedIndex(format!(
            "{name}: unsupported version {found} (expected {version})"
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[6..PREFIX_LEN]);
    let body_len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() != PREFIX_LEN + body_len + 4 {
        return Err(IvfError::CorruptedIndex(format!(
            "{name}: truncated body ({} bytes, header says {body_len})",
            bytes.len().saturating_sub(PREFIX_LEN + 4)
        )));
    }
    let body = &bytes[PREFIX_LEN..PREFIX_LEN + body_len];
    let tail = &bytes[PREFIX_LEN + body_len..];
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32fast::hash(body) != stored {
        return Err(IvfError::CorruptedIndex(format!("{name}: checksum mismatch")));
    }
    Ok(bincode::deserialize(body)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(not(windows))]
fn atomic_replace(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::rename(src, dst)
}

#[cfg(windows)]
fn atomic_replace(src: &Path, dst: &Path) -> std::io::Result<()> {
    const MAX_RETRIES: u32 = 3;
    for attempt in 0..MAX_RETRIES {
        match std::fs::rename(src, dst) {
            Ok(()) => return Ok(()),
            Err(_) if attempt < MAX_RETRIES - 1 => {
                let _ = std::fs::remove_file(dst);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
    std::fs::rename(src, dst)
}
