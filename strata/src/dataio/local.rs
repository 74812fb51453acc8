//! On-disk block files
//!
//! Each block owns two files in the data directory:
//! - `{id:08}.blk`: the batch as an Arrow IPC stream
//! - `{id:08}.dlt`: the deltas, `magic(4) | crc32(4) | bincode body`
//!
//! `write_data` writes `.tmp` siblings; `sync` renames them into place so a
//! crash between the two leaves the previous version intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use super::{assemble_delta, BlockFile, FileFactory};
use crate::catalog::BlockId;
use crate::txn::Timestamp;
use crate::updates::BlockDelta;
use crate::{Result, StrataError, Value};

const DELTA_MAGIC: &[u8; 4] = b"SDLT";
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Serialize, Deserialize)]
struct PersistedDelta {
    visible_ts: Timestamp,
    /// (column, serialized mask, values)
    updates: Vec<(u16, Vec<u8>, Vec<(u32, Value)>)>,
    deletes: Option<Vec<u8>>,
}

fn mask_bytes(mask: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(mask.serialized_size());
    mask.serialize_into(&mut buf)?;
    Ok(buf)
}

pub struct LocalBlockFile {
    data_path: PathBuf,
    delta_path: PathBuf,
    max_visible: AtomicU64,
    /// Serializes writers of the same block
    io: Mutex<()>,
}

impl LocalBlockFile {
    pub fn open(dir: &Path, block: BlockId) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = Self {
            data_path: dir.join(format!("{:08}.blk", block)),
            delta_path: dir.join(format!("{:08}.dlt", block)),
            max_visible: AtomicU64::new(0),
            io: Mutex::new(()),
        };
        if file.delta_path.exists() {
            let persisted = file.read_persisted(&file.delta_path)?;
            file.max_visible.store(persisted.visible_ts, Ordering::Release);
        }
        Ok(file)
    }

    fn tmp(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        {
            let mut stream_writer = StreamWriter::try_new(&mut writer, &batch.schema())?;
            stream_writer.write(batch)?;
            stream_writer.finish()?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn write_persisted(path: &Path, delta: &PersistedDelta) -> Result<()> {
        let body = bincode::serialize(delta)?;
        let mut file = File::create(path)?;
        file.write_all(DELTA_MAGIC)?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_persisted(&self, path: &Path) -> Result<PersistedDelta> {
        let bytes = fs::read(path)?;
        if bytes.len() < 8 || &bytes[0..4] != DELTA_MAGIC {
            return Err(StrataError::Corrupted(format!("bad delta file {}", path.display())));
        }
        let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if crc32fast::hash(&bytes[8..]) != crc {
            return Err(StrataError::Corrupted(format!(
                "delta checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(bincode::deserialize(&bytes[8..])?)
    }
}

impl BlockFile for LocalBlockFile {
    fn write_data(
        &self,
        batch: &RecordBatch,
        visible_ts: Timestamp,
        update_masks: &BTreeMap<u16, RoaringBitmap>,
        update_values: &BTreeMap<u16, BTreeMap<u32, Value>>,
        delete_mask: Option<&RoaringBitmap>,
    ) -> Result<()> {
        let _io = self.io.lock();
        let mut updates = Vec::with_capacity(update_masks.len());
        for (col, mask) in update_masks {
            let values = update_values
                .get(col)
                .map(|v| v.iter().map(|(r, v)| (*r, v.clone())).collect())
                .unwrap_or_default();
            updates.push((*col, mask_bytes(mask)?, values));
        }
        let persisted = PersistedDelta {
            visible_ts,
            updates,
            deletes: delete_mask.map(mask_bytes).transpose()?,
        };

        Self::write_batch(&Self::tmp(&self.data_path), batch)?;
        Self::write_persisted(&Self::tmp(&self.delta_path), &persisted)?;
        log::debug!(
            "wrote {} rows to {} at ts {}",
            batch.num_rows(),
            self.data_path.display(),
            visible_ts
        );
        Ok(())
    }

    fn load_data(&self) -> Result<Option<RecordBatch>> {
        if !self.data_path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.data_path)?);
        let mut stream_reader = StreamReader::try_new(reader, None)?;
        match stream_reader.next() {
            Some(batch) => Ok(Some(batch?)),
            None => Err(StrataError::Corrupted(format!(
                "empty block file {}",
                self.data_path.display()
            ))),
        }
    }

    fn load_deltas(&self) -> Result<BlockDelta> {
        if !self.delta_path.exists() {
            return Ok(BlockDelta::default());
        }
        let persisted = self.read_persisted(&self.delta_path)?;
        let mut masks = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (col, mask, vals) in persisted.updates {
            masks.insert(col, RoaringBitmap::deserialize_from(&mask[..])?);
            values.insert(col, vals.into_iter().collect::<BTreeMap<u32, Value>>());
        }
        let deletes = persisted
            .deletes
            .map(|d| RoaringBitmap::deserialize_from(&d[..]))
            .transpose()?;
        Ok(assemble_delta(&masks, &values, deletes.as_ref()))
    }

    fn sync(&self) -> Result<()> {
        let _io = self.io.lock();
        let data_tmp = Self::tmp(&self.data_path);
        let delta_tmp = Self::tmp(&self.delta_path);
        if !data_tmp.exists() {
            return Ok(());
        }
        fs::rename(&data_tmp, &self.data_path)?;
        if delta_tmp.exists() {
            fs::rename(&delta_tmp, &self.delta_path)?;
        }
        let persisted = self.read_persisted(&self.delta_path)?;
        self.max_visible.store(persisted.visible_ts, Ordering::Release);
        Ok(())
    }

    fn max_visible(&self) -> Timestamp {
        self.max_visible.load(Ordering::Acquire)
    }

    fn destroy(&self) -> Result<()> {
        let _io = self.io.lock();
        for path in [
            self.data_path.clone(),
            self.delta_path.clone(),
            Self::tmp(&self.data_path),
            Self::tmp(&self.delta_path),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Opens `LocalBlockFile`s under one directory
pub struct LocalFileFactory {
    dir: PathBuf,
}

impl LocalFileFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl FileFactory for LocalFileFactory {
    fn block_file(&self, block: BlockId) -> Result<Arc<dyn BlockFile>> {
        Ok(Arc::new(LocalBlockFile::open(&self.dir, block)?))
    }
}
