//! Durable wait stores.
//!
//! Both implementations serialize every operation behind one mutex, and the
//! SQLite one additionally wraps each state transition in a transaction, so a
//! request is matched by at most one signal and drained at most once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::WaitStore;
use waypoint_core::types::RunId;
use waypoint_core::wait::{SignalEnvelope, SignalOutcome, WaitKey, WaitRequest, WaitStatus};

/// SQLite-backed wait store. Survives process restarts, so a run suspended on
/// a signal can be resumed by a later process.
pub struct SqliteWaitStore {
    conn: Mutex<Connection>,
}

const REQUEST_COLUMNS: &str =
    "seq, id, run_id, wait_key, deadline, status, created_at, signal_json";

impl SqliteWaitStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS wait_requests (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 id TEXT NOT NULL UNIQUE,
                 run_id TEXT NOT NULL,
                 wait_key TEXT NOT NULL,
                 deadline TEXT,
                 status TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 signal_json TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_wait_match
                 ON wait_requests(run_id, wait_key, status, seq);
             CREATE INDEX IF NOT EXISTS idx_wait_status
                 ON wait_requests(status, seq);

             CREATE TABLE IF NOT EXISTS signals (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 wait_key TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 received_at TEXT NOT NULL,
                 matched_request TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_signals_key
                 ON signals(run_id, wait_key, seq);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))
    }
}

impl WaitStore for SqliteWaitStore {
    fn insert_wait(
        &self,
        wait_key: &WaitKey,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<WaitRequest> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO wait_requests (id, run_id, wait_key, deadline, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                id,
                wait_key.run_id.as_str(),
                wait_key.key,
                deadline.map(ts),
                ts(created_at),
            ],
        )
        .map_err(db_err)?;

        Ok(WaitRequest {
            id,
            wait_key: wait_key.clone(),
            deadline,
            status: WaitStatus::Pending,
            seq: conn.last_insert_rowid() as u64,
            created_at,
            signal: None,
        })
    }

    fn signal(&self, wait_key: &WaitKey, payload: serde_json::Value) -> Result<SignalOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let matched: Option<String> = tx
            .query_row(
                "SELECT id FROM wait_requests
                 WHERE run_id = ?1 AND wait_key = ?2 AND status = 'pending'
                 ORDER BY seq LIMIT 1",
                params![wait_key.run_id.as_str(), wait_key.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let received_at = Utc::now();
        tx.execute(
            "INSERT INTO signals (run_id, wait_key, payload, received_at, matched_request)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                wait_key.run_id.as_str(),
                wait_key.key,
                serde_json::to_string(&payload)?,
                ts(received_at),
                matched,
            ],
        )
        .map_err(db_err)?;
        let seq = tx.last_insert_rowid() as u64;

        let outcome = match matched {
            Some(request_id) => {
                let envelope = SignalEnvelope {
                    wait_key: wait_key.clone(),
                    payload,
                    seq,
                    received_at,
                    matched_request: Some(request_id.clone()),
                };
                tx.execute(
                    "UPDATE wait_requests SET status = 'ready', signal_json = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![serde_json::to_string(&envelope)?, request_id],
                )
                .map_err(db_err)?;
                SignalOutcome::Scheduled { request_id }
            }
            None => SignalOutcome::NoWaiter,
        };

        tx.commit().map_err(db_err)?;
        Ok(outcome)
    }

    fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE wait_requests SET status = 'expired'
             WHERE status = 'pending' AND deadline IS NOT NULL AND deadline <= ?1",
            params![ts(now)],
        )
        .map_err(db_err)
    }

    fn drain_ready(&self) -> Result<Vec<WaitRequest>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let mut drained = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {} FROM wait_requests
                     WHERE status IN ('ready', 'expired') ORDER BY seq",
                    REQUEST_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt.query_map([], row_to_request).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        tx.execute(
            "UPDATE wait_requests SET status = 'consumed' WHERE status IN ('ready', 'expired')",
            [],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        for request in &mut drained {
            request.status = WaitStatus::Consumed;
        }
        Ok(drained)
    }

    fn get(&self, request_id: &str) -> Result<Option<WaitRequest>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM wait_requests WHERE id = ?1", REQUEST_COLUMNS),
            params![request_id],
            row_to_request,
        )
        .optional()
        .map_err(db_err)
    }

    fn pending_for_run(&self, run_id: &RunId) -> Result<Vec<WaitRequest>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM wait_requests
                 WHERE run_id = ?1 AND status = 'pending' ORDER BY seq",
                REQUEST_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], row_to_request)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn cancel_run(&self, run_id: &RunId) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE wait_requests SET status = 'consumed'
             WHERE run_id = ?1 AND status IN ('pending', 'ready', 'expired')",
            params![run_id.as_str()],
        )
        .map_err(db_err)
    }

    fn signals(&self, wait_key: &WaitKey) -> Result<Vec<SignalEnvelope>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, payload, received_at, matched_request FROM signals
                 WHERE run_id = ?1 AND wait_key = ?2 ORDER BY seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![wait_key.run_id.as_str(), wait_key.key], |row| {
                let payload: String = row.get(1)?;
                let received: String = row.get(2)?;
                Ok(SignalEnvelope {
                    wait_key: wait_key.clone(),
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    seq: row.get::<_, i64>(0)? as u64,
                    received_at: parse_ts(&received),
                    matched_request: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<WaitRequest> {
    let run_id: String = row.get(2)?;
    let deadline: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let signal_json: Option<String> = row.get(7)?;

    Ok(WaitRequest {
        seq: row.get::<_, i64>(0)? as u64,
        id: row.get(1)?,
        wait_key: WaitKey {
            run_id: RunId(run_id),
            key: row.get(3)?,
        },
        deadline: deadline.as_deref().map(parse_ts),
        // An unreadable status is never redelivered.
        status: WaitStatus::parse(&status).unwrap_or(WaitStatus::Consumed),
        created_at: parse_ts(&created_at),
        signal: signal_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Fixed-width UTC timestamps so SQL string comparison orders correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Database(e.to_string())
}

/// Non-durable wait store with the same semantics, for tests and probation.
///
/// Consumed requests are dropped, so `get` only finds outstanding ones.
#[derive(Default)]
pub struct InMemoryWaitStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    requests: Vec<WaitRequest>,
    signals: Vec<SignalEnvelope>,
    next_request_seq: u64,
    next_signal_seq: u64,
}

impl InMemoryWaitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| WaypointError::Wait(e.to_string()))
    }
}

impl WaitStore for InMemoryWaitStore {
    fn insert_wait(
        &self,
        wait_key: &WaitKey,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<WaitRequest> {
        let mut state = self.lock()?;
        state.next_request_seq += 1;
        let request = WaitRequest {
            id: uuid::Uuid::new_v4().to_string(),
            wait_key: wait_key.clone(),
            deadline,
            status: WaitStatus::Pending,
            seq: state.next_request_seq,
            created_at: Utc::now(),
            signal: None,
        };
        state.requests.push(request.clone());
        Ok(request)
    }

    fn signal(&self, wait_key: &WaitKey, payload: serde_json::Value) -> Result<SignalOutcome> {
        let mut state = self.lock()?;
        state.next_signal_seq += 1;
        let seq = state.next_signal_seq;

        // Requests are stored in seq order, so the first hit is the oldest.
        let matched = state
            .requests
            .iter()
            .position(|r| r.status == WaitStatus::Pending && &r.wait_key == wait_key);

        let mut envelope = SignalEnvelope {
            wait_key: wait_key.clone(),
            payload,
            seq,
            received_at: Utc::now(),
            matched_request: None,
        };

        let outcome = match matched {
            Some(idx) => {
                let request_id = state.requests[idx].id.clone();
                envelope.matched_request = Some(request_id.clone());
                let request = &mut state.requests[idx];
                request.status = WaitStatus::Ready;
                request.signal = Some(envelope.clone());
                SignalOutcome::Scheduled { request_id }
            }
            None => SignalOutcome::NoWaiter,
        };
        state.signals.push(envelope);
        Ok(outcome)
    }

    fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock()?;
        let mut expired = 0;
        for request in state.requests.iter_mut() {
            if request.status == WaitStatus::Pending
                && request.deadline.map(|d| d <= now).unwrap_or(false)
            {
                request.status = WaitStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn drain_ready(&self) -> Result<Vec<WaitRequest>> {
        let mut state = self.lock()?;
        let mut drained = Vec::new();
        state.requests.retain_mut(|request| {
            if matches!(request.status, WaitStatus::Ready | WaitStatus::Expired) {
                request.status = WaitStatus::Consumed;
                drained.push(request.clone());
                return false;
            }
            true
        });
        Ok(drained)
    }

    fn get(&self, request_id: &str) -> Result<Option<WaitRequest>> {
        let state = self.lock()?;
        Ok(state.requests.iter().find(|r| r.id == request_id).cloned())
    }

    fn pending_for_run(&self, run_id: &RunId) -> Result<Vec<WaitRequest>> {
        let state = self.lock()?;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status == WaitStatus::Pending && &r.wait_key.run_id == run_id)
            .cloned()
            .collect())
    }

    fn cancel_run(&self, run_id: &RunId) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.requests.len();
        state.requests.retain(|r| &r.wait_key.run_id != run_id);
        Ok(before - state.requests.len())
    }

    fn signals(&self, wait_key: &WaitKey) -> Result<Vec<SignalEnvelope>> {
        let state = self.lock()?;
        Ok(state
            .signals
            .iter()
            .filter(|s| &s.wait_key == wait_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn stores() -> Vec<Arc<dyn WaitStore>> {
        vec![
            Arc::new(SqliteWaitStore::in_memory().unwrap()),
            Arc::new(InMemoryWaitStore::new()),
        ]
    }

    #[test]
    fn signals_match_oldest_waiter_first() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "reply");
            let first = store.insert_wait(&key, None).unwrap();
            let second = store.insert_wait(&key, None).unwrap();
            assert!(second.seq > first.seq);

            assert_eq!(
                store.signal(&key, json!(1)).unwrap(),
                SignalOutcome::Scheduled { request_id: first.id.clone() }
            );
            assert_eq!(
                store.signal(&key, json!(2)).unwrap(),
                SignalOutcome::Scheduled { request_id: second.id.clone() }
            );

            let drained = store.drain_ready().unwrap();
            assert_eq!(drained.len(), 2);
            assert_eq!(drained[0].id, first.id);
            assert_eq!(drained[0].signal.as_ref().unwrap().payload, json!(1));
            assert_eq!(drained[1].signal.as_ref().unwrap().payload, json!(2));
        }
    }

    #[test]
    fn unmatched_signal_is_recorded_but_not_buffered() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "late");
            assert_eq!(store.signal(&key, json!("early")).unwrap(), SignalOutcome::NoWaiter);

            let request = store.insert_wait(&key, None).unwrap();
            assert!(store.drain_ready().unwrap().is_empty());
            assert_eq!(
                store.get(&request.id).unwrap().unwrap().status,
                WaitStatus::Pending
            );

            let log = store.signals(&key).unwrap();
            assert_eq!(log.len(), 1);
            assert!(log[0].matched_request.is_none());
        }
    }

    #[test]
    fn keys_are_isolated_per_run() {
        for store in stores() {
            let a = RunId::new();
            let b = RunId::new();
            let wait_a = store.insert_wait(&WaitKey::new(&a, "k"), None).unwrap();
            store.insert_wait(&WaitKey::new(&b, "k"), None).unwrap();

            store.signal(&WaitKey::new(&a, "k"), json!(null)).unwrap();
            let drained = store.drain_ready().unwrap();
            assert_eq!(drained.len(), 1);
            assert_eq!(drained[0].id, wait_a.id);
            assert_eq!(store.pending_for_run(&b).unwrap().len(), 1);
        }
    }

    #[test]
    fn deadlines_expire_once() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "timer");
            let now = Utc::now();
            store.insert_wait(&key, Some(now - Duration::seconds(1))).unwrap();
            store.insert_wait(&key, Some(now + Duration::hours(1))).unwrap();

            assert_eq!(store.expire_due(now).unwrap(), 1);
            let drained = store.drain_ready().unwrap();
            assert_eq!(drained.len(), 1);
            assert!(drained[0].signal.is_none());
            assert_eq!(drained[0].status, WaitStatus::Consumed);

            assert_eq!(store.expire_due(now).unwrap(), 0);
            assert!(store.drain_ready().unwrap().is_empty());
        }
    }

    #[test]
    fn consumed_requests_ignore_further_signals() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "once");
            store.insert_wait(&key, None).unwrap();
            store.signal(&key, json!(1)).unwrap();
            assert_eq!(store.drain_ready().unwrap().len(), 1);

            assert_eq!(store.signal(&key, json!(2)).unwrap(), SignalOutcome::NoWaiter);
            assert!(store.drain_ready().unwrap().is_empty());
        }
    }

    #[test]
    fn concurrent_signals_schedule_exactly_once() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "race");
            store.insert_wait(&key, None).unwrap();

            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = store.clone();
                    let key = key.clone();
                    std::thread::spawn(move || store.signal(&key, json!(i)).unwrap())
                })
                .collect();
            let scheduled = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| matches!(o, SignalOutcome::Scheduled { .. }))
                .count();

            assert_eq!(scheduled, 1);
            assert_eq!(store.drain_ready().unwrap().len(), 1);
            assert_eq!(store.signals(&key).unwrap().len(), 16);
        }
    }

    #[test]
    fn cancel_run_consumes_outstanding_waits() {
        for store in stores() {
            let run = RunId::new();
            let key = WaitKey::new(&run, "x");
            store.insert_wait(&key, None).unwrap();
            store.insert_wait(&key, None).unwrap();
            store.signal(&key, json!(1)).unwrap();

            assert_eq!(store.cancel_run(&run).unwrap(), 2);
            assert!(store.drain_ready().unwrap().is_empty());
            assert!(store.pending_for_run(&run).unwrap().is_empty());
        }
    }

    #[test]
    fn in_memory_store_drops_consumed_requests() {
        let store = InMemoryWaitStore::new();
        let run = RunId::new();
        let key = WaitKey::new(&run, "k");
        let signalled = store.insert_wait(&key, None).unwrap();
        let cancelled = store.insert_wait(&key, None).unwrap();

        store.signal(&key, json!(1)).unwrap();
        assert_eq!(store.drain_ready().unwrap()[0].id, signalled.id);
        assert!(store.get(&signalled.id).unwrap().is_none());

        assert_eq!(store.cancel_run(&run).unwrap(), 1);
        assert!(store.get(&cancelled.id).unwrap().is_none());
        assert!(store.lock().unwrap().requests.is_empty());
        assert_eq!(store.signal(&key, json!(2)).unwrap(), SignalOutcome::NoWaiter);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waits.db");
        let run = RunId::new();
        let key = WaitKey::approval(&run, "review");
        {
            let store = SqliteWaitStore::open(&path).unwrap();
            store.insert_wait(&key, None).unwrap();
        }

        let store = SqliteWaitStore::open(&path).unwrap();
        let pending = store.pending_for_run(&run).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].wait_key, key);

        store.signal(&key, json!({"approved": true})).unwrap();
        let drained = store.drain_ready().unwrap();
        assert_eq!(drained[0].signal.as_ref().unwrap().payload["approved"], true);
    }
}
