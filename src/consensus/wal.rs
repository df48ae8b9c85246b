//! Write-ahead log of everything the consensus state machine processes.
//!
//! Frame layout:
//!
//! ```text
//! [checksum: u32 BE][length: u32 BE][payload: bincode TimedWalMessage]
//! ```
//!
//! The checksum is the first four bytes of the SHA-256 of the payload. A
//! new log starts with `EndHeight(0)`; every committed height is closed by
//! `EndHeight(h)` so replay can find where a height begins.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::message::MsgInfo;
use super::timeout::TimeoutInfo;
use crate::common::crypto::sha256;
use crate::types::{decode, encode, CodecError, Height, Timestamp};

/// Largest payload accepted in one frame.
pub const MAX_MSG_SIZE_BYTES: usize = 1024 * 1024;

const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] io::Error),

    #[error("wal codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("wal message of {0} bytes exceeds {MAX_MSG_SIZE_BYTES}")]
    TooLarge(usize),

    #[error("wal corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("wal truncated at offset {0}")]
    Truncated(u64),

    #[error("wal lock poisoned")]
    Poisoned,
}

impl WalError {
    /// Damage in the log itself rather than a failure to access it.
    pub fn is_data_corruption(&self) -> bool {
        matches!(self, WalError::Corrupted { .. } | WalError::Truncated(_))
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum WalMessage {
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
    TxsAvailable,
    EndHeight(Height),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimedWalMessage {
    pub time: Timestamp,
    pub msg: WalMessage,
}

fn checksum(payload: &[u8]) -> u32 {
    let digest = sha256(payload);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn encode_frame(msg: &TimedWalMessage) -> Result<Vec<u8>, WalError> {
    let payload = encode(msg)?;
    if payload.len() > MAX_MSG_SIZE_BYTES {
        return Err(WalError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&checksum(&payload).to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads frames one by one, tracking the offset of the last complete frame.
pub struct WalDecoder<R: Read> {
    reader: R,
    offset: u64,
}

impl<R: Read> WalDecoder<R> {
    pub fn new(reader: R) -> Self {
        WalDecoder { reader, offset: 0 }
    }

    /// Offset just past the last frame decoded successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Fills `buf` completely. Returns the bytes read if the stream ended first.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, WalError> {
        let mut read = 0;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    /// Ok(None) at a clean end of log.
    pub fn decode(&mut self) -> Result<Option<TimedWalMessage>, WalError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.read_full(&mut header)? {
            0 => return Ok(None),
            FRAME_HEADER_LEN => {}
            _ => return Err(WalError::Truncated(self.offset)),
        }
        let crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_MSG_SIZE_BYTES {
            return Err(WalError::Corrupted {
                offset: self.offset,
                reason: format!("length {} exceeds maximum", len),
            });
        }
        let mut payload = vec![0u8; len];
        if self.read_full(&mut payload)? != len {
            return Err(WalError::Truncated(self.offset));
        }
        if checksum(&payload) != crc {
            return Err(WalError::Corrupted {
                offset: self.offset,
                reason: "checksum mismatch".to_string(),
            });
        }
        let msg = decode(&payload).map_err(|e| WalError::Corrupted {
            offset: self.offset,
            reason: e.to_string(),
        })?;
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(msg))
    }
}

/// Entries following an `EndHeight` marker. Yields at most one error, then stops.
pub type WalEntries = Box<dyn Iterator<Item = Result<TimedWalMessage, WalError>> + Send>;

pub trait Wal: Send {
    /// Buffered append; durable after the next flush.
    fn write(&mut self, msg: TimedWalMessage) -> Result<(), WalError>;

    /// Append and fsync before returning.
    fn write_sync(&mut self, msg: TimedWalMessage) -> Result<(), WalError>;

    fn flush_and_sync(&mut self) -> Result<(), WalError>;

    /// Entries after `EndHeight(height)`, or None if the marker is absent.
    /// Corruption before the marker is an error.
    fn search_for_end_height(&mut self, height: Height) -> Result<Option<WalEntries>, WalError>;
}

struct FrameIter<R: Read> {
    decoder: WalDecoder<R>,
    done: bool,
}

impl<R: Read> Iterator for FrameIter<R> {
    type Item = Result<TimedWalMessage, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.decode() {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Append-only log file with a buffered writer.
pub struct FileWal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileWal {
    /// Opens or creates the log. A torn tail is cut off at the last complete
    /// frame; corruption followed by further frames fails the open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let good = Self::last_good_offset(&mut file, len)?;
        if good < len {
            warn!(path = %path.display(), good, len, "repairing wal, dropping damaged tail");
            file.set_len(good)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let mut wal = FileWal {
            path,
            writer: BufWriter::new(file),
        };
        if good == 0 {
            wal.write_sync(TimedWalMessage {
                time: Timestamp::now(),
                msg: WalMessage::EndHeight(0),
            })?;
        }
        info!(path = %wal.path.display(), "opened wal");
        Ok(wal)
    }

    /// Offset just past the last complete frame. Only a torn tail, a frame
    /// whose declared end reaches the end of the file, may be dropped;
    /// damage with intact data after it is an error.
    fn last_good_offset(file: &mut File, len: u64) -> Result<u64, WalError> {
        file.seek(SeekFrom::Start(0))?;
        let mut decoder = WalDecoder::new(BufReader::new(&mut *file));
        let err = loop {
            match decoder.decode() {
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(decoder.offset()),
                Err(e) => break e,
            }
        };
        drop(decoder);
        match err {
            WalError::Truncated(offset) => {
                debug!(offset, "wal ends in a partial frame");
                Ok(offset)
            }
            WalError::Corrupted { offset, reason } => {
                let mut header = [0u8; FRAME_HEADER_LEN];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut header)?;
                let frame_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;
                if offset + FRAME_HEADER_LEN as u64 + frame_len >= len {
                    debug!(offset, %reason, "wal ends in a damaged frame");
                    Ok(offset)
                } else {
                    Err(WalError::Corrupted { offset, reason })
                }
            }
            e => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Wal for FileWal {
    fn write(&mut self, msg: TimedWalMessage) -> Result<(), WalError> {
        let frame = encode_frame(&msg)?;
        self.writer.write_all(&frame)?;
        Ok(())
    }

    fn write_sync(&mut self, msg: TimedWalMessage) -> Result<(), WalError> {
        self.write(msg)?;
        self.flush_and_sync()
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn search_for_end_height(&mut self, height: Height) -> Result<Option<WalEntries>, WalError> {
        self.writer.flush()?;
        let file = File::open(&self.path)?;
        let mut decoder = WalDecoder::new(BufReader::new(file));
        loop {
            match decoder.decode() {
                Ok(Some(TimedWalMessage {
                    msg: WalMessage::EndHeight(h),
                    ..
                })) if h == height => {
                    debug!(height, offset = decoder.offset(), "found end height marker");
                    return Ok(Some(Box::new(FrameIter { decoder, done: false })));
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(None),
                Err(WalError::Truncated(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        if let Err(e) = self.flush_and_sync() {
            warn!(err = %e, "failed to flush wal on close");
        }
    }
}

/// In-memory log. Clones share entries, so a test can inspect what a
/// state machine wrote or hand the same log to a fresh instance.
#[derive(Clone, Default)]
pub struct MemWal {
    entries: Arc<Mutex<Vec<TimedWalMessage>>>,
}

impl MemWal {
    pub fn new() -> Self {
        let wal = MemWal::default();
        if let Ok(mut entries) = wal.entries.lock() {
            entries.push(TimedWalMessage {
                time: Timestamp(0),
                msg: WalMessage::EndHeight(0),
            });
        }
        wal
    }

    pub fn entries(&self) -> Vec<TimedWalMessage> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Wal for MemWal {
    fn write(&mut self, msg: TimedWalMessage) -> Result<(), WalError> {
        self.entries.lock().map_err(|_| WalError::Poisoned)?.push(msg);
        Ok(())
    }

    fn write_sync(&mut self, msg: TimedWalMessage) -> Result<(), WalError> {
        self.write(msg)
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn search_for_end_height(&mut self, height: Height) -> Result<Option<WalEntries>, WalError> {
        let entries = self.entries.lock().map_err(|_| WalError::Poisoned)?;
        let position = entries
            .iter()
            .position(|e| e.msg == WalMessage::EndHeight(height));
        Ok(position.map(|i| {
            let rest: Vec<_> = entries[i + 1..].iter().cloned().map(Ok).collect();
            Box::new(rest.into_iter()) as WalEntries
        }))
    }
}

/// Discards everything. For nodes that do not need crash recovery.
pub struct NilWal;

impl Wal for NilWal {
    fn write(&mut self, _msg: TimedWalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn write_sync(&mut self, _msg: TimedWalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn search_for_end_height(&mut self, _height: Height) -> Result<Option<WalEntries>, WalError> {
        Ok(None)
    }
}
