//! SQLite store adapter.
//!
//! Uses a dedicated thread for SQLite operations since rusqlite::Connection
//! is not Sync. Commands arrive over an mpsc channel and answer through
//! oneshot replies. The `(call_id, sequence)` uniqueness invariant is the
//! packets table's primary key, so duplicate detection is the database's
//! constraint check, atomic against concurrent inserts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use super::{CallStore, InsertOutcome, StoreError};
use crate::call::{CallRecord, CallState, PacketRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS calls (
    call_id           TEXT PRIMARY KEY,
    state             TEXT NOT NULL,
    received_count    INTEGER NOT NULL,
    expected_total    INTEGER,
    expected_next     INTEGER NOT NULL,
    missing           TEXT NOT NULL,
    missing_truncated INTEGER NOT NULL DEFAULT 0,
    transcription     TEXT,
    sentiment         TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS packets (
    call_id     TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    data        TEXT NOT NULL,
    timestamp   REAL NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (call_id, sequence)
);
";

/// Commands sent to the SQLite worker thread.
enum SqliteCommand {
    CreateIfAbsent {
        call_id: String,
        reply: oneshot::Sender<Result<CallRecord, StoreError>>,
    },
    Load {
        call_id: String,
        reply: oneshot::Sender<Result<Option<CallRecord>, StoreError>>,
    },
    Save {
        call: CallRecord,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    InsertPacket {
        packet: PacketRecord,
        reply: oneshot::Sender<Result<InsertOutcome, StoreError>>,
    },
    ListPackets {
        call_id: String,
        reply: oneshot::Sender<Result<Vec<PacketRecord>, StoreError>>,
    },
}

/// SQLite-backed store - one worker thread owns the connection.
pub struct SqliteStore {
    sender: mpsc::Sender<SqliteCommand>,
    _handle: std::thread::JoinHandle<()>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and start the worker.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sqlite_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(map_sqlite_error)?;
        conn.busy_timeout(Duration::from_millis(250))
            .map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;

        info!(path = %path.as_ref().display(), "sqlite store opened");

        let (sender, receiver) = mpsc::channel(256);
        let handle = std::thread::spawn(move || sqlite_worker(conn, receiver));

        Ok(Self {
            sender,
            _handle: handle,
        })
    }

    async fn dispatch<T>(
        &self,
        command: SqliteCommand,
        reply: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| StoreError::Connection("sqlite worker is gone".to_string()))?;
        reply
            .await
            .map_err(|_| StoreError::Connection("sqlite worker dropped the reply".to_string()))?
    }
}

/// Worker thread that owns the SQLite connection.
fn sqlite_worker(conn: Connection, mut receiver: mpsc::Receiver<SqliteCommand>) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            SqliteCommand::CreateIfAbsent { call_id, reply } => {
                let _ = reply.send(do_create_if_absent(&conn, &call_id));
            }
            SqliteCommand::Load { call_id, reply } => {
                let _ = reply.send(do_load(&conn, &call_id));
            }
            SqliteCommand::Save { call, reply } => {
                let _ = reply.send(do_save(&conn, &call));
            }
            SqliteCommand::InsertPacket { packet, reply } => {
                let _ = reply.send(do_insert_packet(&conn, &packet));
            }
            SqliteCommand::ListPackets { call_id, reply } => {
                let _ = reply.send(do_list_packets(&conn, &call_id));
            }
        }
    }
}

#[async_trait::async_trait]
impl CallStore for SqliteStore {
    async fn create_if_absent(&self, call_id: &str) -> Result<CallRecord, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            SqliteCommand::CreateIfAbsent {
                call_id: call_id.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    async fn load(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            SqliteCommand::Load {
                call_id: call_id.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    async fn save(&self, call: &CallRecord) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            SqliteCommand::Save {
                call: call.clone(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    async fn insert_packet(&self, packet: &PacketRecord) -> Result<InsertOutcome, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            SqliteCommand::InsertPacket {
                packet: packet.clone(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    async fn list_packets_ordered(&self, call_id: &str) -> Result<Vec<PacketRecord>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            SqliteCommand::ListPackets {
                call_id: call_id.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }
}

fn do_create_if_absent(conn: &Connection, call_id: &str) -> Result<CallRecord, StoreError> {
    let fresh = CallRecord::new(call_id);
    conn.execute(
        "INSERT OR IGNORE INTO calls
         (call_id, state, received_count, expected_total, expected_next,
          missing, missing_truncated, transcription, sentiment, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            fresh.call_id,
            fresh.state.as_str(),
            fresh.received_count as i64,
            fresh.expected_total.map(|t| t as i64),
            fresh.expected_next as i64,
            encode_missing(&fresh.missing)?,
            fresh.missing_truncated,
            fresh.transcription,
            fresh.sentiment,
            fresh.created_at.to_rfc3339(),
            fresh.updated_at.to_rfc3339(),
        ],
    )
    .map_err(map_sqlite_error)?;

    do_load(conn, call_id)?.ok_or_else(|| {
        StoreError::Backend(format!("call {call_id} missing right after insert"))
    })
}

fn do_load(conn: &Connection, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT call_id, state, received_count, expected_total, expected_next,
                    missing, missing_truncated, transcription, sentiment, created_at, updated_at
             FROM calls WHERE call_id = ?1",
            params![call_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )
        .optional()
        .map_err(map_sqlite_error)?;

    let Some((
        call_id,
        state,
        received_count,
        expected_total,
        expected_next,
        missing,
        missing_truncated,
        transcription,
        sentiment,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(CallRecord {
        state: CallState::parse(&state)
            .ok_or_else(|| StoreError::Backend(format!("unknown call state '{state}'")))?,
        call_id,
        received_count: received_count as u64,
        expected_total: expected_total.map(|t| t as u64),
        expected_next: expected_next as u64,
        missing: decode_missing(&missing)?,
        missing_truncated,
        transcription,
        sentiment,
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
    }))
}

fn do_save(conn: &Connection, call: &CallRecord) -> Result<(), StoreError> {
    let changed = conn
        .execute(
            "UPDATE calls SET
                state = ?2, received_count = ?3, expected_total = ?4,
                expected_next = ?5, missing = ?6, missing_truncated = ?7,
                transcription = ?8, sentiment = ?9, updated_at = ?10
             WHERE call_id = ?1",
            params![
                call.call_id,
                call.state.as_str(),
                call.received_count as i64,
                call.expected_total.map(|t| t as i64),
                call.expected_next as i64,
                encode_missing(&call.missing)?,
                call.missing_truncated,
                call.transcription,
                call.sentiment,
                call.updated_at.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_error)?;

    if changed == 0 {
        return Err(StoreError::NotFound(call.call_id.clone()));
    }
    Ok(())
}

fn do_insert_packet(conn: &Connection, packet: &PacketRecord) -> Result<InsertOutcome, StoreError> {
    let result = conn.execute(
        "INSERT INTO packets (call_id, sequence, data, timestamp, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            packet.call_id,
            packet.sequence as i64,
            packet.data,
            packet.timestamp,
            packet.received_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation =>
        {
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(map_sqlite_error(e)),
    }
}

fn do_list_packets(conn: &Connection, call_id: &str) -> Result<Vec<PacketRecord>, StoreError> {
    let mut statement = conn
        .prepare(
            "SELECT call_id, sequence, data, timestamp, received_at
             FROM packets WHERE call_id = ?1 ORDER BY sequence ASC",
        )
        .map_err(map_sqlite_error)?;

    let rows = statement
        .query_map(params![call_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(map_sqlite_error)?;

    let mut packets = Vec::new();
    for row in rows {
        let (call_id, sequence, data, timestamp, received_at) = row.map_err(map_sqlite_error)?;
        packets.push(PacketRecord {
            call_id,
            sequence: sequence as u64,
            data,
            timestamp,
            received_at: decode_timestamp(&received_at)?,
        });
    }
    Ok(packets)
}

fn encode_missing(missing: &BTreeSet<u64>) -> Result<String, StoreError> {
    serde_json::to_string(missing)
        .map_err(|e| StoreError::Backend(format!("could not encode missing set: {e}")))
}

fn decode_missing(raw: &str) -> Result<BTreeSet<u64>, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Backend(format!("could not decode missing set: {e}")))
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{raw}': {e}")))
}

fn map_sqlite_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Busy(e.to_string())
        }
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::CannotOpen =>
        {
            StoreError::Connection(e.to_string())
        }
        _ => {
            error!(error = %e, "sqlite failure");
            StoreError::Backend(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("calls.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trips_a_call_row() {
        let (_dir, store) = open_temp();
        let mut call = store.create_if_absent("c1").await.unwrap();
        assert_eq!(call.state, CallState::InProgress);

        call.transition(CallState::Completed).unwrap();
        call.expected_total = Some(4);
        call.received_count = 3;
        call.expected_next = 4;
        call.missing.insert(2);
        store.save(&call).await.unwrap();

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.state, CallState::Completed);
        assert_eq!(loaded.expected_total, Some(4));
        assert_eq!(loaded.received_count, 3);
        assert_eq!(loaded.missing_sequences(), vec![2]);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (_dir, store) = open_temp();
        let first = store.create_if_absent("c1").await.unwrap();
        let second = store.create_if_absent("c1").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn unique_constraint_reports_duplicates() {
        let (_dir, store) = open_temp();
        let packet = PacketRecord::new("c1", 7, "hello".to_string(), 1.5);
        assert_eq!(
            store.insert_packet(&packet).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_packet(&packet).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.list_packets_ordered("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn packets_come_back_in_sequence_order() {
        let (_dir, store) = open_temp();
        for sequence in [9u64, 1, 4, 0] {
            let packet = PacketRecord::new("c1", sequence, format!("p{sequence}"), 1.0);
            store.insert_packet(&packet).await.unwrap();
        }
        let sequences: Vec<u64> = store
            .list_packets_ordered("c1")
            .await
            .unwrap()
            .iter()
            .map(|p| p.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 4, 9]);
    }

    #[tokio::test]
    async fn save_of_unknown_call_is_not_found() {
        let (_dir, store) = open_temp();
        let ghost = CallRecord::new("ghost");
        assert!(matches!(
            store.save(&ghost).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
