//! Segmented on-disk write-ahead log
//!
//! File format:
//! ```text
//! +----------------+----------------+----------------+
//! | Header (16B)   | Record 1       | Record 2 ...   |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "SWAL"
//! - version: 2 bytes
//! - segment_id: 6 bytes
//! - checksum: 4 bytes (crc32 of the first 12 bytes)
//!
//! Record:
//! - group: 4 bytes
//! - lsn: 8 bytes
//! - payload_len: 4 bytes
//! - payload: variable
//! - crc32: 4 bytes (over group, lsn and payload)
//! ```
//!
//! A torn or corrupt record ends replay of its segment. Checkpoint positions
//! live in a small `CHECKPOINT` file next to the segments.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{LogStore, WalIndex};
use crate::{Result, StrataError};

const WAL_MAGIC: &[u8; 4] = b"SWAL";
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: usize = 16;
/// Rotate after this many bytes (16 MB)
const MAX_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;
const CHECKPOINT_FILE: &str = "CHECKPOINT";

fn header_bytes(segment_id: u64) -> [u8; WAL_HEADER_SIZE] {
    let mut buf = [0u8; WAL_HEADER_SIZE];
    buf[0..4].copy_from_slice(WAL_MAGIC);
    buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buf[6..12].copy_from_slice(&segment_id.to_le_bytes()[..6]);
    let checksum = crc32fast::hash(&buf[0..12]);
    buf[12..16].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn check_header(buf: &[u8; WAL_HEADER_SIZE]) -> Result<()> {
    if &buf[0..4] != WAL_MAGIC {
        return Err(StrataError::Corrupted("invalid WAL magic".into()));
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&buf[12..16]);
    if crc32fast::hash(&buf[0..12]) != u32::from_le_bytes(stored) {
        return Err(StrataError::Corrupted("WAL header checksum mismatch".into()));
    }
    Ok(())
}

fn record_crc(group: u32, lsn: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&group.to_le_bytes());
    hasher.update(&lsn.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

struct Record {
    group: u32,
    lsn: u64,
    payload: Vec<u8>,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; WAL_HEADER_SIZE];
    if !read_exact_or_eof(&mut file, &mut header)? {
        return Ok(Vec::new());
    }
    check_header(&header)?;

    let mut records = Vec::new();
    loop {
        let mut fixed = [0u8; 16];
        if !read_exact_or_eof(&mut file, &mut fixed)? {
            break;
        }
        let group = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&fixed[4..12]);
        let lsn = u64::from_le_bytes(lsn_bytes);
        let len = u32::from_le_bytes([fixed[12], fixed[13], fixed[14], fixed[15]]) as usize;

        let mut payload = vec![0u8; len];
        let mut crc_buf = [0u8; 4];
        if !read_exact_or_eof(&mut file, &mut payload)? || !read_exact_or_eof(&mut file, &mut crc_buf)? {
            log::warn!("torn WAL record at end of {}", path.display());
            break;
        }
        if record_crc(group, lsn, &payload) != u32::from_le_bytes(crc_buf) {
            log::warn!("WAL record crc mismatch in {}, stopping replay", path.display());
            break;
        }
        records.push(Record { group, lsn, payload });
    }
    Ok(records)
}

/// Open segment being appended to
struct WalSegment {
    id: u64,
    file: BufWriter<File>,
    size: u64,
}

impl WalSegment {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(format!("{:06}.wal", id));
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        let mut file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        file.write_all(&header_bytes(id))?;
        Ok(Self { id, file, size: WAL_HEADER_SIZE as u64 })
    }

    fn append(&mut self, group: u32, lsn: u64, payload: &[u8]) -> Result<()> {
        self.file.write_all(&group.to_le_bytes())?;
        self.file.write_all(&lsn.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&record_crc(group, lsn, payload).to_le_bytes())?;
        self.size += 20 + payload.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

struct WalInner {
    current: Option<WalSegment>,
    next_segment_id: u64,
    next_lsn: HashMap<u32, u64>,
    checkpointed: HashMap<u32, u64>,
    /// segment id → highest lsn per group stored in it
    segment_max: BTreeMap<u64, HashMap<u32, u64>>,
}

/// File-backed `LogStore`
pub struct FileWal {
    dir: PathBuf,
    inner: Mutex<WalInner>,
}

impl FileWal {
    /// Open (or create) the log under `dir`, rebuilding sequence numbers from disk
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut segment_max: BTreeMap<u64, HashMap<u32, u64>> = BTreeMap::new();
        let mut next_lsn: HashMap<u32, u64> = HashMap::new();
        for (id, path) in Self::segment_paths(dir)? {
            let mut maxima = HashMap::new();
            for rec in read_segment(&path)? {
                let m = maxima.entry(rec.group).or_insert(0);
                *m = (*m).max(rec.lsn);
                let n = next_lsn.entry(rec.group).or_insert(1);
                *n = (*n).max(rec.lsn + 1);
            }
            segment_max.insert(id, maxima);
        }
        let checkpointed = Self::read_checkpoints(dir)?;
        let next_segment_id = segment_max.keys().next_back().map(|id| id + 1).unwrap_or(1);

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(WalInner {
                current: None,
                next_segment_id,
                next_lsn,
                checkpointed,
                segment_max,
            }),
        })
    }

    fn segment_paths(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if path.extension().map(|x| x == "wal").unwrap_or(false) {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    segments.push((id, path));
                }
            }
        }
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    fn read_checkpoints(dir: &Path) -> Result<HashMap<u32, u64>> {
        let path = dir.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(path)?;
        if bytes.len() < 4 {
            return Err(StrataError::Corrupted("short checkpoint file".into()));
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        if crc32fast::hash(body) != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
            return Err(StrataError::Corrupted("checkpoint file checksum mismatch".into()));
        }
        Ok(bincode::deserialize(body)?)
    }

    fn write_checkpoints(&self, checkpoints: &HashMap<u32, u64>) -> Result<()> {
        let mut bytes = bincode::serialize(checkpoints)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, &bytes)?;
        fs::rename(tmp, self.dir.join(CHECKPOINT_FILE))?;
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segment_max.len()
    }
}

impl LogStore for FileWal {
    fn append(&self, group: u32, payload: &[u8]) -> Result<WalIndex> {
        let mut inner = self.inner.lock();
        let needs_segment = inner
            .current
            .as_ref()
            .map(|s| s.size >= MAX_WAL_SEGMENT_SIZE)
            .unwrap_or(true);
        if needs_segment {
            let id = inner.next_segment_id;
            inner.current = Some(WalSegment::create(&self.dir, id)?);
            inner.next_segment_id += 1;
            inner.segment_max.insert(id, HashMap::new());
        }

        let lsn = *inner.next_lsn.entry(group).or_insert(1);
        let WalInner { current, segment_max, next_lsn, .. } = &mut *inner;
        let segment = current
            .as_mut()
            .ok_or_else(|| StrataError::Invariant("no open WAL segment".into()))?;
        segment.append(group, lsn, payload)?;
        segment.sync()?;
        segment_max.entry(segment.id).or_default().insert(group, lsn);
        next_lsn.insert(group, lsn + 1);
        Ok(WalIndex::new(group, lsn))
    }

    fn checkpoint(&self, index: &WalIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let done = inner.checkpointed.get(&index.group).copied().unwrap_or(0);
        if index.lsn <= done {
            return Ok(());
        }
        inner.checkpointed.insert(index.group, index.lsn);
        let snapshot = inner.checkpointed.clone();
        drop(inner);
        self.write_checkpoints(&snapshot)
    }

    fn checkpointed(&self, group: u32) -> u64 {
        self.inner.lock().checkpointed.get(&group).copied().unwrap_or(0)
    }

    fn replay(&self, group: u32) -> Result<Vec<(u64, Vec<u8>)>> {
        let floor = self.checkpointed(group);
        let mut out = Vec::new();
        for (_, path) in Self::segment_paths(&self.dir)? {
            for rec in read_segment(&path)? {
                if rec.group == group && rec.lsn > floor {
                    out.push((rec.lsn, rec.payload));
                }
            }
        }
        out.sort_by_key(|(lsn, _)| *lsn);
        Ok(out)
    }

    /// Delete segments whose records are all checkpointed. The open segment
    /// is closed and deleted too once it holds records and all are covered.
    fn truncate(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let current = inner.current.as_ref().map(|s| s.id);
        let reclaimable: Vec<u64> = inner
            .segment_max
            .iter()
            .filter(|(id, maxima)| Some(**id) != current || !maxima.is_empty())
            .filter(|(_, maxima)| {
                maxima
                    .iter()
                    .all(|(g, lsn)| inner.checkpointed.get(g).copied().unwrap_or(0) >= *lsn)
            })
            .map(|(id, _)| *id)
            .collect();
        if current.is_some_and(|id| reclaimable.contains(&id)) {
            if let Some(mut segment) = inner.current.take() {
                segment.sync()?;
            }
        }
        for id in &reclaimable {
            inner.segment_max.remove(id);
            let path = self.dir.join(format!("{:06}.wal", id));
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("failed to remove WAL segment {}: {}", path.display(), e);
            }
        }
        log::debug!("truncated {} WAL segments", reclaimable.len());
        Ok(reclaimable.len())
    }
}
