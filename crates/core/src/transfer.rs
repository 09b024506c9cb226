use std::fs::File;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::chunk::DEFAULT_PART_BYTES;
use crate::pool::default_worker_count;
use crate::progress::ProgressTracker;

/// Concurrent part transfers per file. Pool fan-out governs cross-file
/// parallelism; this bound keeps one huge file from monopolizing the
/// connection pool.
pub(crate) const PART_STREAMS: usize = 8;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub part_bytes: u64,
    pub workers: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            part_bytes: DEFAULT_PART_BYTES,
            workers: default_worker_count(),
        }
    }
}

#[derive(Default)]
pub struct TransferOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub tracker: Option<&'a ProgressTracker>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    pub num_files: u64,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}

#[cfg(unix)]
pub(crate) fn read_file_range(file: &File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

#[cfg(not(unix))]
pub(crate) fn read_file_range(file: &File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    handle.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write `bytes` at `offset` without moving any shared cursor. Concurrent
/// writers touch disjoint ranges, so no locking is needed.
#[cfg(unix)]
pub(crate) fn write_file_range(file: &File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(bytes, offset)
}

#[cfg(not(unix))]
pub(crate) fn write_file_range(file: &File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(offset))?;
    handle.write_all(bytes)
}
