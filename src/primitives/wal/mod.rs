#![forbid(unsafe_code)]

use std::convert::TryInto;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{page::PAGE_SIZE, record_crc32, Checksum, Crc32Fast, PenumbraError, Result};

const WAL_MAGIC: [u8; 4] = *b"PNBW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 12;

/// Kind of a WAL record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalRecordKind {
    /// A committed write transaction; the payload carries its operations.
    Commit,
    /// The checkpoint durability point.
    Checkpoint,
}

impl WalRecordKind {
    fn tag(self) -> u8 {
        match self {
            WalRecordKind::Commit => 1,
            WalRecordKind::Checkpoint => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(WalRecordKind::Commit),
            2 => Some(WalRecordKind::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    page_size: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        let crc = compute_crc32(&[&buf[..12]]);
        buf[12..16].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(PenumbraError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(PenumbraError::Corruption("wal magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != WAL_FORMAT_VERSION {
            return Err(PenumbraError::Corruption("wal format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(src[12..16].try_into().unwrap());
        if compute_crc32(&[&src[..12]]) != stored_crc {
            return Err(PenumbraError::Corruption("wal header crc mismatch"));
        }
        let page_size = u32::from_be_bytes(src[8..12].try_into().unwrap());
        if page_size as usize != PAGE_SIZE {
            return Err(PenumbraError::Corruption("wal page size mismatch"));
        }
        Ok(Self { page_size })
    }
}

/// Result of reading the log from the start.
#[derive(Debug, Default)]
pub struct WalScan {
    /// Commit payloads logged after the most recent checkpoint record, in order.
    pub commits: Vec<Vec<u8>>,
    /// Whether the last intact record is a checkpoint record.
    pub ends_with_checkpoint: bool,
    /// Number of intact records.
    pub records: usize,
    /// Offset just past the last intact record.
    pub valid_up_to: u64,
}

/// Append-only log of committed transactions and checkpoint markers.
///
/// Every record is checksummed; a torn or corrupt tail ends a scan and is
/// overwritten by the next append.
pub struct Wal {
    io: Arc<dyn FileIo>,
    append_offset: Mutex<u64>,
}

impl Wal {
    /// Opens the log, writing a fresh header when the file is shorter than
    /// one. A full-length header that fails to decode is an error.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len >= FILE_HEADER_LEN as u64 {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            FileHeader::decode(&buf)?;
        } else {
            if len > 0 {
                warn!(len, "wal.open.reset_short_header");
            }
            let header = FileHeader {
                page_size: PAGE_SIZE as u32,
            };
            io.truncate(0)?;
            io.write_at(0, &header.encode())?;
            io.sync_all()?;
        }
        let wal = Self {
            io,
            append_offset: Mutex::new(FILE_HEADER_LEN as u64),
        };
        let scan = wal.scan()?;
        if scan.valid_up_to < wal.io.len()? {
            wal.io.truncate(scan.valid_up_to)?;
        }
        *wal.append_offset.lock() = scan.valid_up_to;
        Ok(wal)
    }

    /// Reads a log that may not exist yet without modifying it.
    pub fn scan_io(io: &dyn FileIo) -> Result<WalScan> {
        let len = io.len()?;
        let mut scan = WalScan {
            valid_up_to: FILE_HEADER_LEN as u64,
            ..WalScan::default()
        };
        if len < FILE_HEADER_LEN as u64 {
            return Ok(scan);
        }
        let mut header = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut header)?;
        FileHeader::decode(&header)?;
        let mut offset = FILE_HEADER_LEN as u64;
        while offset + RECORD_HEADER_LEN as u64 <= len {
            let mut rec = [0u8; RECORD_HEADER_LEN];
            io.read_at(offset, &mut rec)?;
            let Some(kind) = WalRecordKind::from_tag(rec[0]) else {
                break;
            };
            let payload_len = u32::from_be_bytes(rec[4..8].try_into().unwrap()) as u64;
            let stored_crc = u32::from_be_bytes(rec[8..12].try_into().unwrap());
            let payload_off = offset + RECORD_HEADER_LEN as u64;
            if payload_off + payload_len > len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            io.read_at(payload_off, &mut payload)?;
            if record_crc32(kind.tag(), &payload) != stored_crc {
                break;
            }
            match kind {
                WalRecordKind::Commit => {
                    scan.commits.push(payload);
                    scan.ends_with_checkpoint = false;
                }
                WalRecordKind::Checkpoint => {
                    scan.commits.clear();
                    scan.ends_with_checkpoint = true;
                }
            }
            scan.records += 1;
            offset = payload_off + payload_len;
            scan.valid_up_to = offset;
        }
        if scan.valid_up_to < len {
            debug!(valid_up_to = scan.valid_up_to, len, "wal.scan.torn_tail");
        }
        Ok(scan)
    }

    /// Reads every intact record of this log.
    pub fn scan(&self) -> Result<WalScan> {
        Self::scan_io(self.io.as_ref())
    }

    fn append(&self, kind: WalRecordKind, payload: &[u8]) -> Result<()> {
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| PenumbraError::Invalid("wal record too large"))?;
        let mut offset = self.append_offset.lock();
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        buf.push(kind.tag());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&record_crc32(kind.tag(), payload).to_be_bytes());
        buf.extend_from_slice(payload);
        self.io.write_at(*offset, &buf)?;
        self.io.sync_all()?;
        *offset += buf.len() as u64;
        debug!(kind = ?kind, bytes = buf.len(), "wal.append");
        Ok(())
    }

    /// Appends a commit record and makes it durable.
    pub fn log_commit(&self, payload: &[u8]) -> Result<()> {
        self.append(WalRecordKind::Commit, payload)
    }

    /// Appends the checkpoint record and makes it durable.
    pub fn log_and_flush_checkpoint(&self) -> Result<()> {
        self.append(WalRecordKind::Checkpoint, &[])
    }

    /// Drops every record, keeping the file header.
    pub fn clear(&self) -> Result<()> {
        let mut offset = self.append_offset.lock();
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        *offset = FILE_HEADER_LEN as u64;
        Ok(())
    }

    /// Current size of the log in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> bool {
        *self.append_offset.lock() <= FILE_HEADER_LEN as u64
    }
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
