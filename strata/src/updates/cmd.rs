//! Redo commands written to the WAL
//!
//! Wire layout of one command (big-endian):
//! ```text
//! | type: i16 | id: u32 | body ... |
//! ```
//! Row masks are roaring bitmaps in their portable serialization, prefixed by
//! a u32 byte length. Column values are a bincode-encoded `Vec<(u32, Value)>`
//! with the same prefix.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringBitmap;

use super::column_chain::ColumnDelta;
use crate::catalog::BlockId;
use crate::txn::{Timestamp, TxnId};
use crate::{Result, StrataError, Value};

pub const CMD_UPDATE: i16 = 0x3000;
pub const CMD_DELETE: i16 = 0x3001;
pub const CMD_APPEND: i16 = 0x3002;
pub const CMD_COMPACT_BLOCK: i16 = 0x3003;

/// One redo record produced by a transaction entry
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateCmd {
    Update { id: u32, block: BlockId, column: u16, delta: ColumnDelta },
    Delete { id: u32, block: BlockId, mask: RoaringBitmap },
    Append { id: u32, block: BlockId, start_row: u32, rows: u32 },
    CompactBlock { id: u32, from: BlockId, to: BlockId },
}

fn write_mask<W: Write>(w: &mut W, mask: &RoaringBitmap) -> Result<()> {
    let mut buf = Vec::with_capacity(mask.serialized_size());
    mask.serialize_into(&mut buf)?;
    w.write_u32::<BigEndian>(buf.len() as u32)?;
    w.write_all(&buf)?;
    Ok(())
}

fn read_mask<R: Read>(r: &mut R) -> Result<RoaringBitmap> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(RoaringBitmap::deserialize_from(&buf[..])?)
}

fn write_blob<W: Write>(w: &mut W, blob: &[u8]) -> Result<()> {
    w.write_u32::<BigEndian>(blob.len() as u32)?;
    w.write_all(blob)?;
    Ok(())
}

fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

impl UpdateCmd {
    pub fn cmd_type(&self) -> i16 {
        match self {
            UpdateCmd::Update { .. } => CMD_UPDATE,
            UpdateCmd::Delete { .. } => CMD_DELETE,
            UpdateCmd::Append { .. } => CMD_APPEND,
            UpdateCmd::CompactBlock { .. } => CMD_COMPACT_BLOCK,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            UpdateCmd::Update { id, .. }
            | UpdateCmd::Delete { id, .. }
            | UpdateCmd::Append { id, .. }
            | UpdateCmd::CompactBlock { id, .. } => *id,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i16::<BigEndian>(self.cmd_type())?;
        w.write_u32::<BigEndian>(self.id())?;
        match self {
            UpdateCmd::Update { block, column, delta, .. } => {
                w.write_u64::<BigEndian>(*block)?;
                w.write_u16::<BigEndian>(*column)?;
                write_mask(w, &delta.mask)?;
                let values: Vec<(u32, Value)> =
                    delta.values.iter().map(|(r, v)| (*r, v.clone())).collect();
                write_blob(w, &bincode::serialize(&values)?)?;
            }
            UpdateCmd::Delete { block, mask, .. } => {
                w.write_u64::<BigEndian>(*block)?;
                write_mask(w, mask)?;
            }
            UpdateCmd::Append { block, start_row, rows, .. } => {
                w.write_u64::<BigEndian>(*block)?;
                w.write_u32::<BigEndian>(*start_row)?;
                w.write_u32::<BigEndian>(*rows)?;
            }
            UpdateCmd::CompactBlock { from, to, .. } => {
                w.write_u64::<BigEndian>(*from)?;
                w.write_u64::<BigEndian>(*to)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let cmd_type = r.read_i16::<BigEndian>()?;
        let id = r.read_u32::<BigEndian>()?;
        let cmd = match cmd_type {
            CMD_UPDATE => {
                let block = r.read_u64::<BigEndian>()?;
                let column = r.read_u16::<BigEndian>()?;
                let mask = read_mask(r)?;
                let values: Vec<(u32, Value)> = bincode::deserialize(&read_blob(r)?)?;
                if values.len() as u64 != mask.len() {
                    return Err(StrataError::Corrupted(format!(
                        "update command {} has {} values for {} masked rows",
                        id,
                        values.len(),
                        mask.len()
                    )));
                }
                UpdateCmd::Update {
                    id,
                    block,
                    column,
                    delta: ColumnDelta { mask, values: values.into_iter().collect() },
                }
            }
            CMD_DELETE => {
                let block = r.read_u64::<BigEndian>()?;
                UpdateCmd::Delete { id, block, mask: read_mask(r)? }
            }
            CMD_APPEND => UpdateCmd::Append {
                id,
                block: r.read_u64::<BigEndian>()?,
                start_row: r.read_u32::<BigEndian>()?,
                rows: r.read_u32::<BigEndian>()?,
            },
            CMD_COMPACT_BLOCK => UpdateCmd::CompactBlock {
                id,
                from: r.read_u64::<BigEndian>()?,
                to: r.read_u64::<BigEndian>()?,
            },
            other => {
                return Err(StrataError::Corrupted(format!("unknown command type {:#x}", other)))
            }
        };
        Ok(cmd)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut Cursor::new(bytes))
    }
}

/// All commands of one committing transaction, logged as a single WAL record
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBatch {
    pub txn: TxnId,
    pub commit_ts: Timestamp,
    pub cmds: Vec<UpdateCmd>,
}

impl CommandBatch {
    pub fn new(txn: TxnId, commit_ts: Timestamp) -> Self {
        Self { txn, commit_ts, cmds: Vec::new() }
    }

    pub fn push(&mut self, cmd: UpdateCmd) {
        self.cmds.push(cmd);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u64::<BigEndian>(self.txn)?;
        buf.write_u64::<BigEndian>(self.commit_ts)?;
        buf.write_u32::<BigEndian>(self.cmds.len() as u32)?;
        for cmd in &self.cmds {
            cmd.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let txn = r.read_u64::<BigEndian>()?;
        let commit_ts = r.read_u64::<BigEndian>()?;
        let count = r.read_u32::<BigEndian>()?;
        let mut cmds = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cmds.push(UpdateCmd::read_from(&mut r)?);
        }
        if (r.position() as usize) != bytes.len() {
            return Err(StrataError::Corrupted("trailing bytes after command batch".into()));
        }
        Ok(Self { txn, commit_ts, cmds })
    }
}
