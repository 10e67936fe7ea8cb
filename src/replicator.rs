//! The replication session.
//!
//! Owns the connection for its lifetime: negotiates publication and slot
//! setup, streams `pgoutput` frames, assembles per-transaction row events,
//! and acknowledges the server at commit boundaries once the handler has
//! accepted every event of the transaction.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ReplicationOptions;
use crate::handler::{DmlHandler, HandlerOutcome};
use crate::postgres::connection::{PgReplicationConn, ReplicationConn, ServerMessage};
use crate::postgres::decoder::{self, PgOutputMessage, TupleData};
use crate::postgres::relation::RelationSet;
use crate::postgres::types::{format_lsn, EventKind, Lsn, ReplicationEvent};
use crate::Result;

/// Liveness floor for a single receive; expiry loops without acknowledging.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLSTATE for "duplicate object", tolerated during setup DDL.
const DUPLICATE_OBJECT: &str = "42710";

pub struct Replicator<H> {
    options: ReplicationOptions,
    handler: H,
    set: RelationSet,
    /// Highest commit LSN the handler has accepted. Never decreases; only
    /// advanced after handler success.
    last_flushed_lsn: Lsn,
    /// Set once a handler failure leaves a transaction unacknowledged.
    /// `last_flushed_lsn` must never advance past an un-applied commit, so
    /// acknowledgement stays frozen for the rest of the session.
    ack_stalled: bool,
    /// Row events decoded since the last commit boundary, in stream order.
    pending: Vec<ReplicationEvent>,
}

impl<H: DmlHandler> Replicator<H> {
    pub fn new(options: ReplicationOptions, handler: H) -> Self {
        Self {
            options,
            handler,
            set: RelationSet::new(),
            last_flushed_lsn: 0,
            ack_stalled: false,
            pending: Vec::new(),
        }
    }

    /// Opens a replication connection and runs the session until cancelled
    /// or a fatal error occurs.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        self.options.validate()?;
        let mut conn = PgReplicationConn::connect(
            &self.options.postgres.url(),
            Duration::from_secs(self.options.postgres.connect_timeout_secs),
        )
        .await?;

        let result = self.run(&mut conn, cancel).await;
        if let Err(e) = conn.close().await {
            debug!("error closing replication connection: {e}");
        }
        result
    }

    /// Runs the session over an already-open connection.
    ///
    /// Returns `Ok(())` on cancellation; every other exit is a fatal error.
    /// No acknowledgement has been issued for un-applied events, so the
    /// caller may reconnect and the server will replay them.
    pub async fn run<C: ReplicationConn>(
        &mut self,
        conn: &mut C,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.options.validate()?;
        self.setup(conn).await?;

        // Tell the handler the stream is live.
        self.handler.handle(ReplicationEvent::ready()).await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("replication cancelled");
                    return Ok(());
                }

                message = conn.wait_for_message(WAIT_TIMEOUT) => {
                    match message? {
                        None => continue,
                        Some(ServerMessage::XLogData { wal_start, data, .. }) => {
                            self.handle_frame(conn, wal_start, &data).await?;
                        }
                        Some(ServerMessage::Keepalive { reply_requested, .. }) => {
                            if reply_requested {
                                conn.send_standby_status(self.last_flushed_lsn, false).await?;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn setup<C: ReplicationConn>(&mut self, conn: &mut C) -> Result<()> {
        let slot = self.options.slot_name.clone();

        if self.options.monitor_update_columns {
            for table in self.options.tables.clone() {
                self.exec_ddl(conn, &format!("ALTER TABLE {table} REPLICA IDENTITY FULL;"))
                    .await?;
            }
        }

        self.exec_ddl(
            conn,
            &format!(
                "CREATE PUBLICATION {slot} FOR {}",
                self.options.publication_tables()
            ),
        )
        .await?;

        match conn.create_replication_slot(&slot).await? {
            Some(consistent_point) => {
                self.last_flushed_lsn = consistent_point;
            }
            None => {
                // Pre-existing slot: the server replays from its stored
                // confirmed flush position.
                self.last_flushed_lsn = 0;
            }
        }

        conn.start_replication(&slot, 0, &plugin_args("1", &slot))
            .await
    }

    async fn exec_ddl<C: ReplicationConn>(&self, conn: &mut C, sql: &str) -> Result<()> {
        debug!(sql, "setup");
        match conn.exec(sql).await {
            Err(e) if e.sql_state() == Some(DUPLICATE_OBJECT) => {
                debug!(sql, "object already exists");
                Ok(())
            }
            other => other,
        }
    }

    async fn handle_frame<C: ReplicationConn>(
        &mut self,
        conn: &mut C,
        wal_start: Lsn,
        data: &[u8],
    ) -> Result<()> {
        match decoder::parse(data)? {
            PgOutputMessage::Relation(relation) => {
                trace!(
                    id = relation.id,
                    schema = %relation.namespace,
                    table = %relation.name,
                    "relation"
                );
                self.set.add(relation);
            }
            PgOutputMessage::Insert {
                relation_id,
                new_row,
            } => {
                let event = self.dump(EventKind::Insert, relation_id, &new_row, None)?;
                self.pending.push(event);
            }
            PgOutputMessage::Update {
                relation_id,
                old_row,
                new_row,
            } => {
                let old = old_row.as_ref().map(|(_, tuple)| tuple);
                let event = self.dump(EventKind::Update, relation_id, &new_row, old)?;
                self.pending.push(event);
            }
            PgOutputMessage::Delete {
                relation_id,
                old_row,
                ..
            } => {
                let event = self.dump(EventKind::Delete, relation_id, &old_row, None)?;
                self.pending.push(event);
            }
            PgOutputMessage::Commit { .. } => {
                self.commit(conn, wal_start).await?;
            }
            PgOutputMessage::Begin { .. }
            | PgOutputMessage::Origin { .. }
            | PgOutputMessage::Type { .. }
            | PgOutputMessage::Truncate { .. } => {}
        }
        Ok(())
    }

    /// Combines a decoded row message with the catalogue into an event.
    fn dump(
        &self,
        kind: EventKind,
        relation_id: u32,
        row: &TupleData,
        old_row: Option<&TupleData>,
    ) -> Result<ReplicationEvent> {
        let (schema, table) = self.set.assist(relation_id)?;
        let (schema, table) = (schema.to_string(), table.to_string());
        let body = self.set.values(relation_id, row)?;

        // Best effort: a prior image that fails to decode only costs the
        // changed-columns list, not the event.
        let changed_columns = old_row
            .and_then(|old| self.set.values(relation_id, old).ok())
            .map(|old_values| {
                let mut changed: Vec<String> = old_values
                    .iter()
                    .filter(|&(name, old_value)| body.get(name) != Some(old_value))
                    .map(|(name, _)| name.clone())
                    .collect();
                changed.sort();
                changed
            })
            .unwrap_or_default();

        Ok(ReplicationEvent {
            kind,
            schema,
            table,
            body,
            changed_columns,
        })
    }

    /// Delivers the buffered transaction and, if every event was accepted,
    /// advances the flush position and acknowledges the server.
    ///
    /// A standby status must never carry an LSN past an un-applied commit:
    /// the server would discard that transaction's WAL and the changes would
    /// be lost on reconnect. So a single handler failure freezes
    /// acknowledgement for the rest of the session; the server replays
    /// everything past `last_flushed_lsn` on the next connect.
    async fn commit<C: ReplicationConn>(&mut self, conn: &mut C, wal_start: Lsn) -> Result<()> {
        let events = std::mem::take(&mut self.pending);
        if events.is_empty() {
            return Ok(());
        }

        for event in events {
            match self.handler.handle(event).await {
                HandlerOutcome::Success => {}
                HandlerOutcome::Ignore => {
                    debug!("handler ignored event");
                }
                HandlerOutcome::Error => {
                    // Skip the remainder of the batch; later events must not
                    // land before an earlier failure.
                    self.ack_stalled = true;
                    warn!(
                        lsn = %format_lsn(self.last_flushed_lsn),
                        "handler failed, acknowledgement frozen for this session"
                    );
                    return Ok(());
                }
            }
        }

        if self.ack_stalled {
            debug!(
                lsn = %format_lsn(self.last_flushed_lsn),
                "acknowledgement stalled by an earlier handler failure"
            );
            return Ok(());
        }

        self.last_flushed_lsn = wal_start;
        debug!(lsn = %format_lsn(self.last_flushed_lsn), "acknowledging commit");
        conn.send_standby_status(self.last_flushed_lsn, false).await
    }

    /// Removes the slot and publication created by [`Replicator::start`].
    pub async fn teardown(&mut self) -> Result<()> {
        self.options.validate()?;
        let mut conn = PgReplicationConn::connect(
            &self.options.postgres.url(),
            Duration::from_secs(self.options.postgres.connect_timeout_secs),
        )
        .await?;
        let result = self.teardown_with(&mut conn).await;
        if let Err(e) = conn.close().await {
            debug!("error closing replication connection: {e}");
        }
        result
    }

    /// Drops the slot and publication over an already-open connection.
    /// Errors are propagated; teardown is not idempotent on the slot.
    pub async fn teardown_with<C: ReplicationConn>(&mut self, conn: &mut C) -> Result<()> {
        let slot = &self.options.slot_name;
        conn.exec(&format!("SELECT pg_drop_replication_slot('{slot}');"))
            .await?;
        conn.exec(&format!("DROP PUBLICATION IF EXISTS {slot};"))
            .await?;
        info!(slot = %slot, "replication slot and publication dropped");
        Ok(())
    }
}

fn plugin_args(proto_version: &str, publication: &str) -> Vec<String> {
    vec![
        format!("proto_version '{proto_version}'"),
        format!("publication_names '{publication}'"),
    ]
}
