//! Builders assembling raw `pgoutput` frames for decoder tests.

use bytes::{BufMut, Bytes, BytesMut};

/// One cell of a tuple under construction.
#[derive(Debug, Clone, Copy)]
pub enum Cell<'a> {
    Null,
    Toast,
    Text(&'a str),
    Binary(&'a [u8]),
}

pub fn begin_frame(final_lsn: u64, commit_time: i64, xid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(commit_time);
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit_frame(commit_lsn: u64, end_lsn: u64, commit_time: i64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0); // flags
    buf.put_u64(commit_lsn);
    buf.put_u64(end_lsn);
    buf.put_i64(commit_time);
    buf.freeze()
}

pub fn origin_frame(commit_lsn: u64, name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'O');
    buf.put_u64(commit_lsn);
    put_cstr(&mut buf, name);
    buf.freeze()
}

/// Columns are `(name, type_oid, is_key)`.
pub fn relation_frame(
    id: u32,
    namespace: &str,
    name: &str,
    replica_identity: u8,
    columns: &[(&str, u32, bool)],
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(id);
    put_cstr(&mut buf, namespace);
    put_cstr(&mut buf, name);
    buf.put_u8(replica_identity);
    buf.put_u16(columns.len() as u16);
    for (col_name, type_oid, is_key) in columns {
        buf.put_u8(u8::from(*is_key));
        put_cstr(&mut buf, col_name);
        buf.put_u32(*type_oid);
        buf.put_i32(-1); // type modifier
    }
    buf.freeze()
}

pub fn type_frame(id: u32, namespace: &str, name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'Y');
    buf.put_u32(id);
    put_cstr(&mut buf, namespace);
    put_cstr(&mut buf, name);
    buf.freeze()
}

pub fn insert_frame(relation_id: u32, cells: &[Cell]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(relation_id);
    buf.put_u8(b'N');
    put_tuple(&mut buf, cells);
    buf.freeze()
}

/// `old` is `(tag, cells)` with tag `b'K'` or `b'O'`.
pub fn update_frame(relation_id: u32, old: Option<(u8, &[Cell])>, new: &[Cell]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(relation_id);
    if let Some((tag, cells)) = old {
        buf.put_u8(tag);
        put_tuple(&mut buf, cells);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf.freeze()
}

pub fn delete_frame(relation_id: u32, tag: u8, cells: &[Cell]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(relation_id);
    buf.put_u8(tag);
    put_tuple(&mut buf, cells);
    buf.freeze()
}

pub fn truncate_frame(relation_ids: &[u32], options: u8) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(relation_ids.len() as u32);
    buf.put_u8(options);
    for id in relation_ids {
        buf.put_u32(*id);
    }
    buf.freeze()
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, cells: &[Cell]) {
    buf.put_u16(cells.len() as u16);
    for cell in cells {
        match cell {
            Cell::Null => buf.put_u8(b'n'),
            Cell::Toast => buf.put_u8(b'u'),
            Cell::Text(s) => {
                buf.put_u8(b't');
                buf.put_i32(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
            Cell::Binary(raw) => {
                buf.put_u8(b'b');
                buf.put_i32(raw.len() as i32);
                buf.put_slice(raw);
            }
        }
    }
}
