//! Shared fixtures for session tests: a scripted replication connection, a
//! recording handler, and raw `pgoutput` frame builders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use pg_relay::postgres::{Lsn, ReplicationConn, ServerMessage};
use pg_relay::{DmlHandler, Error, EventKind, HandlerOutcome, ReplicationEvent, Result};

/// One scripted response from [`MockConn::wait_for_message`].
pub enum Step {
    Message(ServerMessage),
    Deadline,
    Fail(Error),
}

/// A replication connection that replays a fixed script and records
/// everything sent to it. When the script runs dry it fires the session's
/// cancellation token so the loop exits cleanly.
pub struct MockConn {
    script: VecDeque<Step>,
    /// Consistent point reported by slot creation; `None` simulates a
    /// pre-existing slot.
    pub slot_lsn: Option<Lsn>,
    pub executed: Arc<Mutex<Vec<String>>>,
    pub statuses: Arc<Mutex<Vec<(Lsn, bool)>>>,
    cancel: CancellationToken,
}

impl MockConn {
    pub fn new(script: Vec<Step>, slot_lsn: Option<Lsn>, cancel: CancellationToken) -> Self {
        Self {
            script: script.into(),
            slot_lsn,
            executed: Arc::new(Mutex::new(Vec::new())),
            statuses: Arc::new(Mutex::new(Vec::new())),
            cancel,
        }
    }
}

#[async_trait]
impl ReplicationConn for MockConn {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn create_replication_slot(&mut self, slot: &str) -> Result<Option<Lsn>> {
        self.executed
            .lock()
            .unwrap()
            .push(format!("CREATE_REPLICATION_SLOT {slot} LOGICAL pgoutput"));
        Ok(self.slot_lsn)
    }

    async fn start_replication(
        &mut self,
        slot: &str,
        _start_lsn: Lsn,
        plugin_args: &[String],
    ) -> Result<()> {
        self.executed
            .lock()
            .unwrap()
            .push(format!("START_REPLICATION {slot} ({})", plugin_args.join(", ")));
        Ok(())
    }

    async fn wait_for_message(&mut self, _timeout: Duration) -> Result<Option<ServerMessage>> {
        match self.script.pop_front() {
            Some(Step::Message(message)) => Ok(Some(message)),
            Some(Step::Deadline) => Ok(None),
            Some(Step::Fail(err)) => Err(err),
            None => {
                self.cancel.cancel();
                Ok(None)
            }
        }
    }

    async fn send_standby_status(&mut self, lsn: Lsn, reply_requested: bool) -> Result<()> {
        self.statuses.lock().unwrap().push((lsn, reply_requested));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Records every event and answers DML events from a queue of outcomes
/// (defaulting to `Success` when the queue is empty).
pub struct RecordingHandler {
    pub events: Arc<Mutex<Vec<ReplicationEvent>>>,
    outcomes: VecDeque<HandlerOutcome>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            outcomes: VecDeque::new(),
        }
    }

    pub fn with_outcomes(outcomes: Vec<HandlerOutcome>) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            outcomes: outcomes.into(),
        }
    }
}

#[async_trait]
impl DmlHandler for RecordingHandler {
    async fn handle(&mut self, event: ReplicationEvent) -> HandlerOutcome {
        let is_ready = event.kind == EventKind::Ready;
        self.events.lock().unwrap().push(event);
        if is_ready {
            HandlerOutcome::Success
        } else {
            self.outcomes.pop_front().unwrap_or(HandlerOutcome::Success)
        }
    }
}

/// Wraps a raw `pgoutput` frame in an XLogData server message.
pub fn xlog(wal_start: Lsn, data: Bytes) -> Step {
    Step::Message(ServerMessage::XLogData {
        wal_start,
        wal_end: wal_start,
        server_clock: 0,
        data,
    })
}

pub fn keepalive(wal_end: Lsn, reply_requested: bool) -> Step {
    Step::Message(ServerMessage::Keepalive {
        wal_end,
        server_clock: 0,
        reply_requested,
    })
}

// Frame builders mirroring the pgoutput encoding used by the decoder.

#[derive(Debug, Clone, Copy)]
pub enum Cell<'a> {
    Null,
    Text(&'a str),
}

pub fn begin_frame(final_lsn: u64, xid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(0);
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit_frame(commit_lsn: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(commit_lsn);
    buf.put_u64(commit_lsn + 8);
    buf.put_i64(0);
    buf.freeze()
}

pub fn relation_frame(
    id: u32,
    namespace: &str,
    name: &str,
    columns: &[(&str, u32, bool)],
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(id);
    put_cstr(&mut buf, namespace);
    put_cstr(&mut buf, name);
    buf.put_u8(b'd');
    buf.put_u16(columns.len() as u16);
    for (col_name, type_oid, is_key) in columns {
        buf.put_u8(u8::from(*is_key));
        put_cstr(&mut buf, col_name);
        buf.put_u32(*type_oid);
        buf.put_i32(-1);
    }
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

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, cells: &[Cell]) {
    buf.put_u16(cells.len() as u16);
    for cell in cells {
        match cell {
            Cell::Null => buf.put_u8(b'n'),
            Cell::Text(s) => {
                buf.put_u8(b't');
                buf.put_i32(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
        }
    }
}
