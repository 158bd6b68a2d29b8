//! Write-ahead log: data records and segmented append-only storage.
//!
//! Every entry mutation that must be replayable is captured as a
//! [`DataRecord`]. The record byte layout is contractual (big-endian):
//!
//! ```text
//! cache_id:u32  key_len:u32  key
//! has_value:u8  [value_len:u32  value]
//! op:u8  has_near_xid:u8  [near_xid:16]  write_ver:16
//! expire_time:i64  partition:u32  update_counter:i64  flags:u8
//! ```
//!
//! A value's wire form is its type tag followed by the payload. Version
//! stamps occupy 16 bytes each.
//!
//! Records are appended to segment files. Each segment has a maximum size,
//! after which it is retired and a new segment is created.

use crate::core::error::{CacheError, CacheResult};
use crate::entry::value::CacheValue;
use crate::entry::version::Version;
use anyhow::{Context, Result};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordOp {
    /// First write of a key.
    Create = 1,
    /// Overwrite of an existing key.
    Update = 2,
    /// Removal of a key.
    Delete = 3,
}

impl RecordOp {
    /// Decode an operation byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Create),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

bitflags! {
    /// Data record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Update was applied on the primary node.
        const PRIMARY = 0x01;
        /// Update originated from preloading.
        const PRELOAD = 0x02;
        /// Value was installed from the external store.
        const FROM_STORE = 0x04;
    }
}

/// A single WAL data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Owning cache.
    pub cache_id: u32,

    /// Key bytes.
    pub key: Bytes,

    /// New value; absent for removals.
    pub value: Option<CacheValue>,

    /// Logged operation.
    pub op: RecordOp,

    /// Near transaction id for transactional updates.
    pub near_xid: Option<Version>,

    /// Write version of the update.
    pub write_version: Version,

    /// Absolute expire time; 0 means eternal.
    pub expire_time: i64,

    /// Owning partition.
    pub partition: u32,

    /// Partition update counter assigned to this update.
    pub update_counter: i64,

    /// Record flags.
    pub flags: RecordFlags,
}

impl DataRecord {
    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let value_len = self
            .value
            .as_ref()
            .map_or(0, |v| 4 + 1 + v.as_bytes().len());
        4 + 4
            + self.key.len()
            + 1
            + value_len
            + 1
            + 1
            + self.near_xid.map_or(0, |_| Version::WIRE_SIZE)
            + Version::WIRE_SIZE
            + 8
            + 4
            + 8
            + 1
    }

    /// Encode the record into the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.cache_id);
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);

        match &self.value {
            Some(value) => {
                buf.put_u8(1);
                buf.put_u32(value.as_bytes().len() as u32 + 1);
                buf.put_u8(value.type_tag());
                buf.put_slice(value.as_bytes());
            }
            None => buf.put_u8(0),
        }

        buf.put_u8(self.op as u8);

        match &self.near_xid {
            Some(xid) => {
                buf.put_u8(1);
                xid.write_to(buf);
            }
            None => buf.put_u8(0),
        }

        self.write_version.write_to(buf);
        buf.put_i64(self.expire_time);
        buf.put_u32(self.partition);
        buf.put_i64(self.update_counter);
        buf.put_u8(self.flags.bits());
    }

    /// Decode a record from the buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let cache_id = buf.get_u32();
        let key_len = buf.get_u32() as usize;
        if buf.remaining() < key_len {
            anyhow::bail!("truncated data record key");
        }
        let key = buf.copy_to_bytes(key_len);

        let value = if buf.get_u8() == 1 {
            let value_len = buf.get_u32() as usize;
            if value_len == 0 || buf.remaining() < value_len {
                anyhow::bail!("truncated data record value");
            }
            let type_tag = buf.get_u8();
            let data = buf.copy_to_bytes(value_len - 1);
            Some(CacheValue::with_type_tag(data, type_tag))
        } else {
            None
        };

        let op_byte = buf.get_u8();
        let op = RecordOp::from_byte(op_byte)
            .with_context(|| format!("unknown data record op {}", op_byte))?;

        let near_xid = if buf.get_u8() == 1 {
            Some(Version::read_from(buf))
        } else {
            None
        };

        let write_version = Version::read_from(buf);
        let expire_time = buf.get_i64();
        let partition = buf.get_u32();
        let update_counter = buf.get_i64();
        let flags = RecordFlags::from_bits_truncate(buf.get_u8());

        Ok(Self {
            cache_id,
            key,
            value,
            op,
            near_xid,
            write_version,
            expire_time,
            partition,
            update_counter,
            flags,
        })
    }
}

/// Pointer to an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalPointer {
    /// Segment the record lives in.
    pub segment: u64,

    /// Byte offset of the record inside the segment.
    pub offset: u64,
}

impl std::fmt::Display for WalPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wal:{}:{}", self.segment, self.offset)
    }
}

/// Append-only WAL contract. Multi-producer; appends for one key observe
/// the entry lock, which makes per-key WAL order match version order.
pub trait Wal: Send + Sync {
    /// Append a record and return its pointer.
    fn append(&self, record: &DataRecord) -> CacheResult<WalPointer>;
}

/// A WAL segment file. The current segment accepts appends until it is
/// full; full segments are retired and stay on disk.
#[derive(Debug)]
struct WalSegment {
    id: u64,
    path: PathBuf,
    size_bytes: u64,
}

impl WalSegment {
    fn is_full(&self, max_size: u64) -> bool {
        self.size_bytes >= max_size
    }
}

/// File-backed segmented WAL.
pub struct FileWal {
    dir: PathBuf,
    max_segment_size: u64,
    current: Mutex<Option<WalSegment>>,
    segment_seq: AtomicU64,
}

impl FileWal {
    /// Open (or create) a WAL in the given directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_segment_size(dir, DEFAULT_SEGMENT_MAX_SIZE)
    }

    /// Open a WAL with a custom segment size.
    pub fn open_with_segment_size(dir: impl Into<PathBuf>, max_segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context("failed to create WAL directory")?;

        // Resume numbering after the highest existing segment.
        let mut max_id = 0u64;
        for entry in std::fs::read_dir(&dir).context("failed to scan WAL directory")? {
            let path = entry?.path();
            if let Some(id) = segment_id_of(&path) {
                max_id = max_id.max(id + 1);
            }
        }

        Ok(Self {
            dir,
            max_segment_size,
            current: Mutex::new(None),
            segment_seq: AtomicU64::new(max_id),
        })
    }

    /// Read back every record in segment order. Used by recovery and tests.
    pub fn read_records(&self) -> Result<Vec<DataRecord>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .context("failed to scan WAL directory")?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| segment_id_of(p).is_some())
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            read_segment_records(&path, &mut records)?;
        }
        Ok(records)
    }

    /// The segment the next append goes to, rotating past a full one.
    fn open_segment<'g>(&self, slot: &'g mut Option<WalSegment>) -> &'g mut WalSegment {
        let segment = match slot.take() {
            Some(segment) if !segment.is_full(self.max_segment_size) => segment,
            _ => {
                let id = self.segment_seq.fetch_add(1, Ordering::SeqCst);
                WalSegment {
                    id,
                    path: self.dir.join(format!("segment_{:016}.wal", id)),
                    size_bytes: 0,
                }
            }
        };

        slot.insert(segment)
    }
}

fn segment_id_of(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "wal" {
        return None;
    }
    stem.strip_prefix("segment_")?.parse().ok()
}

fn read_segment_records(path: &Path, out: &mut Vec<DataRecord>) -> Result<()> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return Ok(()),
    };

    let mut reader = BufReader::new(file);
    let mut len_buf = [0u8; 4];

    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("failed to read record length"),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut record_buf = vec![0u8; len];
        reader
            .read_exact(&mut record_buf)
            .context("failed to read record body")?;

        out.push(DataRecord::decode(&mut Bytes::from(record_buf))?);
    }

    Ok(())
}

impl Wal for FileWal {
    fn append(&self, record: &DataRecord) -> CacheResult<WalPointer> {
        let mut guard = self.current.lock();
        let segment = self.open_segment(&mut guard);

        let mut body = BytesMut::with_capacity(record.encoded_len());
        record.encode(&mut body);

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment.path)
            .map_err(|e| CacheError::storage(format!("open segment: {e}")))?;

        let mut writer = BufWriter::new(file);
        writer
            .write_all(&(body.len() as u32).to_be_bytes())
            .and_then(|_| writer.write_all(&body))
            .and_then(|_| writer.flush())
            .map_err(|e| CacheError::storage(format!("append record: {e}")))?;

        let pointer = WalPointer {
            segment: segment.id,
            offset: segment.size_bytes,
        };
        segment.size_bytes += 4 + body.len() as u64;

        Ok(pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(counter: i64) -> DataRecord {
        DataRecord {
            cache_id: 42,
            key: Bytes::from_static(b"key-1"),
            value: Some(CacheValue::with_type_tag(&b"value-1"[..], 3)),
            op: RecordOp::Update,
            near_xid: Some(Version::new(2, 77, 5, 1)),
            write_version: Version::new(2, 78, 5, 1),
            expire_time: 123_456,
            partition: 9,
            update_counter: counter,
            flags: RecordFlags::PRIMARY | RecordFlags::FROM_STORE,
        }
    }

    #[test]
    fn codec_round_trip() {
        let rec = record(11);
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        assert_eq!(buf.len(), rec.encoded_len());

        let decoded = DataRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn delete_record_has_no_value() {
        let rec = DataRecord {
            value: None,
            op: RecordOp::Delete,
            near_xid: None,
            expire_time: 0,
            ..record(1)
        };
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        let decoded = DataRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.value, None);
        assert_eq!(decoded.op, RecordOp::Delete);
        assert_eq!(decoded.near_xid, None);
    }

    #[test]
    fn fixed_layout_prefix() {
        // The first eight bytes are cache_id and key length, big-endian.
        let rec = record(1);
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        assert_eq!(&buf[0..4], &42u32.to_be_bytes());
        assert_eq!(&buf[4..8], &5u32.to_be_bytes());
        assert_eq!(&buf[8..13], b"key-1");
    }

    #[test]
    fn file_wal_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open(dir.path()).unwrap();

        let p1 = wal.append(&record(1)).unwrap();
        let p2 = wal.append(&record(2)).unwrap();
        assert!(p2 > p1);

        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].update_counter, 1);
        assert_eq!(records[1].update_counter, 2);
    }

    #[test]
    fn file_wal_rotates_segments() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open_with_segment_size(dir.path(), 1).unwrap();

        wal.append(&record(1)).unwrap();
        let p2 = wal.append(&record(2)).unwrap();
        assert_eq!(p2.segment, 1);
        assert_eq!(p2.offset, 0);

        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 2);
    }
}
