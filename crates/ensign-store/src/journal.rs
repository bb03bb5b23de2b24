//! # Journal: append-only durability log
//!
//! Every mutation of the store is appended to `journal.log` as a checksummed frame
//! before it is applied to the in-memory index. On open the journal is memory-mapped
//! and replayed front to back to rebuild the index.
//!
//! Frame layout (little endian):
//!
//! | Offset | Size | Field     |
//! |--------|------|-----------|
//! | 0      | 4    | `len`     |
//! | 4      | 4    | `crc32`   |
//! | 8      | 1    | `kind`    |
//! | 9      | len  | `payload` |
//!
//! The checksum covers `kind` and `payload`. A torn or corrupt frame at the tail of
//! the log ends the replay and is truncated away when the journal is reopened for
//! writing.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ensign_api::rlid::{Rlid, RLID_LEN};
use ensign_api::v1beta1::{EventWrapper, Topic};
use memmap2::Mmap;
use prost::Message;
use ulid::Ulid;

use crate::errors::{StoreError, StoreResult};

pub const JOURNAL_FILE: &str = "journal.log";

const HEADER_LEN: usize = 9;

const KIND_PUT_TOPIC: u8 = 1;
const KIND_DELETE_TOPIC: u8 = 2;
const KIND_PUT_EVENT: u8 = 3;
const KIND_DESTROY_EVENTS: u8 = 4;
const KIND_PUT_HASH: u8 = 5;
const KIND_CLEAR_HASHES: u8 = 6;

/// A single mutation recorded in the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    PutTopic(Topic),
    DeleteTopic(Ulid),
    PutEvent(EventWrapper),
    DestroyEvents(Ulid),
    PutHash {
        topic_id: Ulid,
        hash: Vec<u8>,
        event_id: Rlid,
    },
    ClearHashes(Ulid),
}

impl Record {
    fn kind(&self) -> u8 {
        match self {
            Self::PutTopic(_) => KIND_PUT_TOPIC,
            Self::DeleteTopic(_) => KIND_DELETE_TOPIC,
            Self::PutEvent(_) => KIND_PUT_EVENT,
            Self::DestroyEvents(_) => KIND_DESTROY_EVENTS,
            Self::PutHash { .. } => KIND_PUT_HASH,
            Self::ClearHashes(_) => KIND_CLEAR_HASHES,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::PutTopic(topic) => topic.encode_to_vec(),
            Self::PutEvent(event) => event.encode_to_vec(),
            Self::DeleteTopic(id) | Self::DestroyEvents(id) | Self::ClearHashes(id) => {
                id.to_bytes().to_vec()
            }
            Self::PutHash {
                topic_id,
                hash,
                event_id,
            } => {
                let mut buf = Vec::with_capacity(16 + RLID_LEN + hash.len());
                buf.extend_from_slice(&topic_id.to_bytes());
                buf.extend_from_slice(event_id.as_bytes());
                buf.extend_from_slice(hash);
                buf
            }
        }
    }

    /// Encode the record as a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        let payload = self.payload();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.push(kind);
        frame.extend_from_slice(&payload);
        frame
    }

    fn decode(kind: u8, payload: &[u8], offset: u64) -> StoreResult<Self> {
        let record = match kind {
            KIND_PUT_TOPIC => Self::PutTopic(Topic::decode(payload)?),
            KIND_PUT_EVENT => Self::PutEvent(EventWrapper::decode(payload)?),
            KIND_DELETE_TOPIC => Self::DeleteTopic(read_ulid(payload, offset)?),
            KIND_DESTROY_EVENTS => Self::DestroyEvents(read_ulid(payload, offset)?),
            KIND_CLEAR_HASHES => Self::ClearHashes(read_ulid(payload, offset)?),
            KIND_PUT_HASH => {
                if payload.len() < 16 + RLID_LEN {
                    return Err(StoreError::Corrupt(offset));
                }
                let topic_id = read_ulid(&payload[..16], offset)?;
                let event_id = Rlid::from_slice(&payload[16..16 + RLID_LEN])
                    .map_err(|_| StoreError::Corrupt(offset))?;
                Self::PutHash {
                    topic_id,
                    hash: payload[16 + RLID_LEN..].to_vec(),
                    event_id,
                }
            }
            _ => return Err(StoreError::Corrupt(offset)),
        };
        Ok(record)
    }
}

fn read_ulid(data: &[u8], offset: u64) -> StoreResult<Ulid> {
    let raw: [u8; 16] = data.try_into().map_err(|_| StoreError::Corrupt(offset))?;
    Ok(Ulid::from_bytes(raw))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Replay the frames of a journal file. Returns the decoded records and the length of
/// the valid prefix of the file.
pub fn replay(path: &Path) -> StoreResult<(Vec<Record>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };

    if file.metadata()?.len() == 0 {
        return Ok((Vec::new(), 0));
    }

    // SAFETY: the journal is only appended to by the store that owns the data
    // directory and the mapping is dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file)? };

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + HEADER_LEN <= mmap.len() {
        let size = read_u32(&mmap, offset) as usize;
        let crc = read_u32(&mmap, offset + 4);
        let kind = mmap[offset + 8];

        let start = offset + HEADER_LEN;
        let Some(end) = start.checked_add(size).filter(|end| *end <= mmap.len()) else {
            tracing::warn!(offset, size, "journal ends with a torn frame");
            break;
        };

        let payload = &mmap[start..end];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        hasher.update(payload);
        if hasher.finalize() != crc {
            tracing::warn!(offset, "journal frame checksum mismatch, ignoring the remainder");
            break;
        }

        records.push(Record::decode(kind, payload, offset as u64)?);
        offset = end;
    }

    if offset < mmap.len() && offset + HEADER_LEN > mmap.len() {
        tracing::warn!(offset, "journal ends with a partial frame header");
    }

    Ok((records, offset as u64))
}

/// Append handle on the journal file.
pub struct Journal {
    file: File,
    path: PathBuf,
    size: u64,
}

impl Journal {
    /// Open (or create) the journal in `dir`, returning the records already in it.
    /// Any invalid tail left behind by a crash is truncated.
    pub fn open(dir: &Path) -> StoreResult<(Self, Vec<Record>)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let (records, valid) = replay(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() > valid {
            tracing::warn!(path = %path.display(), valid, "truncating invalid journal tail");
            file.set_len(valid)?;
        }

        Ok((
            Self {
                file,
                path,
                size: valid,
            },
            records,
        ))
    }

    pub fn append(&mut self, record: &Record) -> StoreResult<()> {
        let frame = record.encode();
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(())
    }

    /// Flush appended frames to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the journal in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<Record> {
        let topic_id = Ulid::new();
        vec![
            Record::PutTopic(Topic {
                id: topic_id.to_bytes().to_vec(),
                name: "testing".into(),
                ..Default::default()
            }),
            Record::PutEvent(EventWrapper {
                id: Rlid::from_parts(1, 1).unwrap().to_vec(),
                topic_id: topic_id.to_bytes().to_vec(),
                event: b"payload".to_vec(),
                ..Default::default()
            }),
            Record::PutHash {
                topic_id,
                hash: vec![0xAB; 32],
                event_id: Rlid::from_parts(1, 1).unwrap(),
            },
            Record::ClearHashes(topic_id),
            Record::DestroyEvents(topic_id),
            Record::DeleteTopic(topic_id),
        ]
    }

    #[test]
    fn test_replay_written_records() {
        let dir = tempfile::tempdir().unwrap();
        let expected = records();

        {
            let (mut journal, existing) = Journal::open(dir.path()).unwrap();
            assert!(existing.is_empty());
            for record in &expected {
                journal.append(record).unwrap();
            }
            journal.sync().unwrap();
            assert_eq!(journal.size(), fs::metadata(journal.path()).unwrap().len());
        }

        let (_, replayed) = Journal::open(dir.path()).unwrap();
        assert_eq!(replayed, expected);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let expected = records();
        let path = dir.path().join(JOURNAL_FILE);

        let valid = {
            let (mut journal, _) = Journal::open(dir.path()).unwrap();
            for record in &expected {
                journal.append(record).unwrap();
            }
            journal.size()
        };

        // Simulate a crash in the middle of writing the next frame.
        let partial = &expected[1].encode()[..12];
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(partial).unwrap();
        drop(file);

        let (journal, replayed) = Journal::open(dir.path()).unwrap();
        assert_eq!(replayed, expected);
        assert_eq!(journal.size(), valid);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let expected = records();

        let mut data = Vec::new();
        for record in &expected[..2] {
            data.extend(record.encode());
        }
        let first = expected[0].encode().len();
        // Flip a payload byte of the second frame.
        data[first + HEADER_LEN + 1] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let (records, valid) = replay(&path).unwrap();
        assert_eq!(records, expected[..1]);
        assert_eq!(valid, first as u64);
    }

    #[test]
    fn test_missing_journal() {
        let dir = tempfile::tempdir().unwrap();
        let (records, valid) = replay(&dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(records.is_empty());
        assert_eq!(valid, 0);
    }
}
