//! Parser for the `pgoutput` logical replication message format.
//!
//! Each WAL data frame carries exactly one message. The first byte is the
//! message kind; all integers are big-endian and strings are nul-terminated.
//! See <https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>.

use bytes::Bytes;

use crate::{Error, Result};

/// Bounds-checked big-endian reader over one frame.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    /// Reads a nul-terminated UTF-8 string.
    fn get_cstr(&mut self) -> Result<String> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::Truncated {
                needed: self.buf.len() + 1,
                remaining: self.buf.len(),
            })?;
        let raw = self.take(nul)?;
        self.take(1)?; // terminator
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Malformed(format!("invalid UTF-8 in string field: {e}")))
    }
}

/// One column cell of a decoded tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleCell {
    Null,
    /// An out-of-line (TOAST) value that was not modified and is therefore
    /// not transmitted.
    UnchangedToast,
    Text(Bytes),
    Binary(Bytes),
}

/// An ordered list of column cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData {
    pub cells: Vec<TupleCell>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl Column {
    /// Whether the column is part of the replica identity (primary key).
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

/// Which prior image an UPDATE or DELETE carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// Replica-identity columns only (`'K'`).
    Key,
    /// The full old row; relation uses REPLICA IDENTITY FULL (`'O'`).
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: u64,
        commit_time: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        commit_time: i64,
    },
    Origin {
        commit_lsn: u64,
        name: String,
    },
    Relation(Relation),
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        new_row: TupleData,
    },
    Update {
        relation_id: u32,
        old_row: Option<(OldTupleKind, TupleData)>,
        new_row: TupleData,
    },
    Delete {
        relation_id: u32,
        old_kind: OldTupleKind,
        old_row: TupleData,
    },
    Truncate {
        relation_ids: Vec<u32>,
        options: u8,
    },
}

/// Parses one complete `pgoutput` frame.
pub fn parse(data: &[u8]) -> Result<PgOutputMessage> {
    let mut cursor = Cursor::new(data);
    let kind = cursor.get_u8()?;
    match kind {
        b'B' => parse_begin(&mut cursor),
        b'C' => parse_commit(&mut cursor),
        b'O' => parse_origin(&mut cursor),
        b'R' => parse_relation(&mut cursor),
        b'Y' => parse_type(&mut cursor),
        b'I' => parse_insert(&mut cursor),
        b'U' => parse_update(&mut cursor),
        b'D' => parse_delete(&mut cursor),
        b'T' => parse_truncate(&mut cursor),
        other => Err(Error::UnknownMessage(other)),
    }
}

fn parse_begin(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    Ok(PgOutputMessage::Begin {
        final_lsn: cursor.get_u64()?,
        commit_time: cursor.get_i64()?,
        xid: cursor.get_u32()?,
    })
}

fn parse_commit(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    Ok(PgOutputMessage::Commit {
        flags: cursor.get_u8()?,
        commit_lsn: cursor.get_u64()?,
        end_lsn: cursor.get_u64()?,
        commit_time: cursor.get_i64()?,
    })
}

fn parse_origin(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    Ok(PgOutputMessage::Origin {
        commit_lsn: cursor.get_u64()?,
        name: cursor.get_cstr()?,
    })
}

fn parse_relation(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    let id = cursor.get_u32()?;
    let namespace = cursor.get_cstr()?;
    let name = cursor.get_cstr()?;
    let replica_identity = cursor.get_u8()?;
    let ncols = cursor.get_u16()?;

    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        columns.push(Column {
            flags: cursor.get_u8()?,
            name: cursor.get_cstr()?,
            type_oid: cursor.get_u32()?,
            type_modifier: cursor.get_i32()?,
        });
    }

    Ok(PgOutputMessage::Relation(Relation {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    }))
}

fn parse_type(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    Ok(PgOutputMessage::Type {
        id: cursor.get_u32()?,
        namespace: cursor.get_cstr()?,
        name: cursor.get_cstr()?,
    })
}

fn parse_insert(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    let relation_id = cursor.get_u32()?;
    let tag = cursor.get_u8()?;
    if tag != b'N' {
        return Err(Error::Malformed(format!(
            "unexpected tuple tag {:?} in INSERT",
            char::from(tag)
        )));
    }
    Ok(PgOutputMessage::Insert {
        relation_id,
        new_row: parse_tuple(cursor)?,
    })
}

fn parse_update(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    let relation_id = cursor.get_u32()?;

    let mut old_row = None;
    let mut tag = cursor.get_u8()?;
    if let Some(kind) = old_tuple_kind(tag) {
        old_row = Some((kind, parse_tuple(cursor)?));
        tag = cursor.get_u8()?;
    }
    if tag != b'N' {
        return Err(Error::Malformed(format!(
            "unexpected tuple tag {:?} in UPDATE",
            char::from(tag)
        )));
    }

    Ok(PgOutputMessage::Update {
        relation_id,
        old_row,
        new_row: parse_tuple(cursor)?,
    })
}

fn parse_delete(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    let relation_id = cursor.get_u32()?;
    let tag = cursor.get_u8()?;
    let old_kind = old_tuple_kind(tag).ok_or_else(|| {
        Error::Malformed(format!(
            "unexpected tuple tag {:?} in DELETE",
            char::from(tag)
        ))
    })?;
    Ok(PgOutputMessage::Delete {
        relation_id,
        old_kind,
        old_row: parse_tuple(cursor)?,
    })
}

fn parse_truncate(cursor: &mut Cursor) -> Result<PgOutputMessage> {
    let n = cursor.get_u32()?;
    let options = cursor.get_u8()?;
    let mut relation_ids = Vec::with_capacity(n as usize);
    for _ in 0..n {
        relation_ids.push(cursor.get_u32()?);
    }
    Ok(PgOutputMessage::Truncate {
        relation_ids,
        options,
    })
}

fn old_tuple_kind(tag: u8) -> Option<OldTupleKind> {
    match tag {
        b'K' => Some(OldTupleKind::Key),
        b'O' => Some(OldTupleKind::Full),
        _ => None,
    }
}

fn parse_tuple(cursor: &mut Cursor) -> Result<TupleData> {
    let ncols = cursor.get_u16()?;
    let mut cells = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let kind = cursor.get_u8()?;
        let cell = match kind {
            b'n' => TupleCell::Null,
            b'u' => TupleCell::UnchangedToast,
            b't' | b'b' => {
                let len = cursor.get_i32()?;
                if len < 0 {
                    return Err(Error::Malformed(format!(
                        "negative cell length {len} in tuple"
                    )));
                }
                let raw = Bytes::copy_from_slice(cursor.take(len as usize)?);
                if kind == b't' {
                    TupleCell::Text(raw)
                } else {
                    TupleCell::Binary(raw)
                }
            }
            other => {
                return Err(Error::Malformed(format!(
                    "unknown tuple cell kind {:?}",
                    char::from(other)
                )));
            }
        };
        cells.push(cell);
    }
    Ok(TupleData { cells })
}
