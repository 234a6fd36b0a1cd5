// store.rs - SQLite-backed ledger of requests, decisions and events.
//
// One connection behind a mutex. The lock is held for a single statement or
// one short transaction, never across I/O outside the database. Status
// changes are a compare-and-set on the current status, so concurrent
// callers racing on the same request see exactly one winner.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::hasher::hash_args;
use crate::record::{
    DecisionRecord, EventKind, EventRecord, NewDecision, NewIntent, RequestRecord, Transition,
};
use crate::schema;
use crate::status::{RequestStatus, UnknownVariant};

/// Default page size for `list_requests`.
pub const DEFAULT_LIST_LIMIT: usize = 200;
/// Upper bound for any page.
pub const MAX_LIST_LIMIT: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_COLUMNS: &str = "id, created_at, updated_at, server, tool, env, args_json, \
     args_hash, actor, status, risk_mode, risk_score, result_ref";
const DECISION_COLUMNS: &str =
    "id, request_id, decided_at, decision, matched_policy_id, condition, reason, decided_by";
const EVENT_COLUMNS: &str = "seq, id, created_at, request_id, kind, payload_json";

/// Clamp a caller-supplied page size to `1..=MAX_LIST_LIMIT`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Handle to the ledger database. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the database file. Call `migrate()` before use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers off the writer's back; in-memory databases report "memory".
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened ledger");
        Self::configure(conn)
    }

    /// A private in-memory ledger, already migrated. Used by tests and dry runs.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let ledger = Self::configure(Connection::open_in_memory()?)?;
        ledger.migrate()?;
        Ok(ledger)
    }

    fn configure(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Apply pending migrations in order. Returns the ids applied by this call.
    pub fn migrate(&self) -> Result<Vec<String>, LedgerError> {
        let mut conn = self.lock()?;
        conn.execute_batch(schema::MIGRATIONS_TABLE)?;
        let mut applied = Vec::new();
        for &(id, sql) in schema::MIGRATIONS {
            let done: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if done {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _migrations (id, applied_at) VALUES (?1, ?2)",
                params![id, now_text()],
            )?;
            tx.commit()?;
            info!(migration = id, "applied ledger migration");
            applied.push(id.to_string());
        }
        Ok(applied)
    }

    /// Ids of every migration recorded in the database, in application order.
    pub fn applied_migrations(&self) -> Result<Vec<String>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM _migrations ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Persist a decided intent: the request in its first durable status, its
    /// initial decision and the opening events, in one transaction.
    pub fn record_intent(
        &self,
        intent: &NewIntent,
        decision: &NewDecision,
    ) -> Result<RequestRecord, LedgerError> {
        let status =
            decision
                .decision
                .initial_status()
                .ok_or(LedgerError::InvalidInitialDecision {
                    decision: decision.decision,
                })?;
        let id = new_id();
        let now = now_text();
        let args_hash = hash_args(&intent.args);
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO requests (id, created_at, updated_at, server, tool, env, args_json, \
                 args_hash, actor, status, risk_mode, risk_score) \
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    now,
                    intent.server,
                    intent.tool,
                    intent.env,
                    serde_json::to_string(&intent.args)?,
                    args_hash,
                    intent.actor,
                    status.as_str(),
                    intent.risk_mode,
                    intent.risk_score,
                ],
            )?;
            insert_decision(&tx, &id, &now, decision)?;
            insert_event(
                &tx,
                &new_id(),
                &now,
                Some(&id),
                EventKind::RequestCreated,
                &json!({
                    "server": intent.server,
                    "tool": intent.tool,
                    "env": intent.env,
                    "args_hash": args_hash,
                    "actor": intent.actor,
                }),
            )?;
            insert_event(
                &tx,
                &new_id(),
                &now,
                Some(&id),
                EventKind::RiskScored,
                &json!({
                    "mode": intent.risk_mode,
                    "score": intent.risk_score,
                    "reasons": intent.risk_reasons,
                    "rules": intent.risk_rules,
                }),
            )?;
            insert_event(
                &tx,
                &new_id(),
                &now,
                Some(&id),
                EventKind::DecisionMade,
                &decision.payload(),
            )?;
            insert_event(
                &tx,
                &new_id(),
                &now,
                Some(&id),
                EventKind::for_transition(RequestStatus::Proposed, status),
                &json!({ "from": RequestStatus::Proposed, "to": status, "reason": decision.reason }),
            )?;
            tx.commit()?;
        }
        info!(
            request_id = %id,
            server = %intent.server,
            tool = %intent.tool,
            env = %intent.env,
            status = %status,
            "recorded intent"
        );
        self.get_request(&id)?
            .ok_or(LedgerError::UnknownRequestId { id })
    }

    /// Move a request from `t.from` to `t.to` if and only if it is still in
    /// `t.from`. The status event, optional decision row and optional result
    /// event commit together with the status change.
    pub fn transition(&self, id: &str, t: &Transition) -> Result<RequestRecord, LedgerError> {
        if !t.from.can_transition_to(t.to) {
            return Err(LedgerError::InvalidTransition {
                from: t.from,
                to: t.to,
            });
        }
        let now = now_text();
        let result_ref = t.result.as_ref().map(|_| new_id());
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE requests SET status = ?1, updated_at = ?2, \
                 result_ref = COALESCE(?3, result_ref) \
                 WHERE id = ?4 AND status = ?5",
                params![t.to.as_str(), now, result_ref, id, t.from.as_str()],
            )?;
            if changed == 0 {
                let actual: Option<String> = tx
                    .query_row(
                        "SELECT status FROM requests WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match actual {
                    None => LedgerError::UnknownRequestId { id: id.to_string() },
                    Some(actual) => LedgerError::AlreadyResolved {
                        id: id.to_string(),
                        expected: t.from,
                        actual: actual.parse()?,
                    },
                });
            }
            if let Some(decision) = &t.decision {
                insert_decision(&tx, id, &now, decision)?;
            }
            if let (Some(event_id), Some(payload)) = (&result_ref, &t.result) {
                insert_event(&tx, event_id, &now, Some(id), EventKind::ToolResult, payload)?;
            }
            insert_event(
                &tx,
                &new_id(),
                &now,
                Some(id),
                EventKind::for_transition(t.from, t.to),
                &t.status_payload(),
            )?;
            tx.commit()?;
        }
        info!(request_id = %id, from = %t.from, to = %t.to, "request transitioned");
        self.get_request(id)?
            .ok_or_else(|| LedgerError::UnknownRequestId { id: id.to_string() })
    }

    /// Append a free-standing event, e.g. a configuration reload.
    pub fn append_event(
        &self,
        request_id: Option<&str>,
        kind: EventKind,
        payload: &Value,
    ) -> Result<String, LedgerError> {
        let id = new_id();
        let conn = self.lock()?;
        insert_event(&conn, &id, &now_text(), request_id, kind, payload)?;
        Ok(id)
    }

    pub fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, LedgerError> {
        let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
        Ok(self.query_requests(&sql, params![id])?.into_iter().next())
    }

    /// Most recent decision for a request (a human resolution, if any).
    pub fn latest_decision(&self, request_id: &str) -> Result<Option<DecisionRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM decisions WHERE request_id = ?1 ORDER BY seq DESC LIMIT 1",
            DECISION_COLUMNS
        );
        Ok(self.query_decisions(&sql, params![request_id])?.into_iter().next())
    }

    pub fn decisions_for(&self, request_id: &str) -> Result<Vec<DecisionRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM decisions WHERE request_id = ?1 ORDER BY seq",
            DECISION_COLUMNS
        );
        self.query_decisions(&sql, params![request_id])
    }

    /// Timeline of one request, oldest first.
    pub fn events_for(&self, request_id: &str) -> Result<Vec<EventRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM events WHERE request_id = ?1 ORDER BY seq",
            EVENT_COLUMNS
        );
        self.query_events(&sql, params![request_id])
    }

    /// The last `limit` events across all requests, oldest first.
    pub fn recent_events(&self, limit: Option<usize>) -> Result<Vec<EventRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM events ORDER BY seq DESC LIMIT ?1",
            EVENT_COLUMNS
        );
        let mut events = self.query_events(&sql, params![clamp_limit(limit) as i64])?;
        events.reverse();
        Ok(events)
    }

    /// Requests newest first, optionally filtered by status.
    pub fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<RequestRecord>, LedgerError> {
        let limit = clamp_limit(limit) as i64;
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM requests WHERE status = ?1 \
                     OR (?1 = 'held' AND status = 'pending') \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                    REQUEST_COLUMNS
                );
                self.query_requests(&sql, params![status.as_str(), limit])
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM requests ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                    REQUEST_COLUMNS
                );
                self.query_requests(&sql, params![limit])
            }
        }
    }

    /// Every request waiting for a human, oldest first.
    pub fn list_held(&self) -> Result<Vec<RequestRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM requests WHERE status IN ('held', 'pending') \
             ORDER BY created_at, rowid",
            REQUEST_COLUMNS
        );
        self.query_requests(&sql, [])
    }

    /// Requests sitting in `approved` or `executing` since before `now - older_than`.
    pub fn stale_in_flight(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<RequestRecord>, LedgerError> {
        let cutoff = format_time(Utc::now() - older_than);
        let sql = format!(
            "SELECT {} FROM requests WHERE status IN ('approved', 'executing') \
             AND COALESCE(updated_at, created_at) < ?1 \
             ORDER BY COALESCE(updated_at, created_at), rowid",
            REQUEST_COLUMNS
        );
        self.query_requests(&sql, params![cutoff])
    }

    /// Preview of the latest execution outcome: the result text on success or
    /// the error on failure.
    pub fn result_preview(&self, request_id: &str) -> Result<Option<String>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM events WHERE request_id = ?1 \
             AND kind IN ('tool.result', 'execution.failed') ORDER BY seq DESC LIMIT 1",
            EVENT_COLUMNS
        );
        let latest = self.query_events(&sql, params![request_id])?.into_iter().next();
        Ok(latest.and_then(|event| {
            ["result_preview", "error"]
                .iter()
                .find_map(|key| event.payload.get(*key))
                .map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        }))
    }

    fn query_requests(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RequestRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RequestRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RequestRow::into_record).collect()
    }

    fn query_decisions(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DecisionRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, DecisionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DecisionRow::into_record).collect()
    }

    fn query_events(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::into_record).collect()
    }

    /// Raw connection access for tests that probe the append-only triggers.
    #[cfg(test)]
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, LedgerError> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_text() -> String {
    format_time(Utc::now())
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            LedgerError::Corrupt(UnknownVariant {
                kind: "timestamp",
                value: text.to_string(),
            })
        })
}

fn insert_decision(
    conn: &Connection,
    request_id: &str,
    at: &str,
    decision: &NewDecision,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO decisions (id, request_id, decided_at, decision, matched_policy_id, \
         condition, reason, decided_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new_id(),
            request_id,
            at,
            decision.decision.as_str(),
            decision.matched_policy_id,
            decision.condition,
            decision.reason,
            decision.decided_by,
        ],
    )?;
    Ok(())
}

fn insert_event(
    conn: &Connection,
    id: &str,
    at: &str,
    request_id: Option<&str>,
    kind: EventKind,
    payload: &Value,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO events (id, created_at, request_id, kind, payload_json) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, at, request_id, kind.as_str(), serde_json::to_string(payload)?],
    )?;
    debug!(event_id = %id, kind = %kind, "appended event");
    Ok(())
}

struct RequestRow {
    id: String,
    created_at: String,
    updated_at: Option<String>,
    server: String,
    tool: String,
    env: String,
    args_json: String,
    args_hash: String,
    actor: Option<String>,
    status: String,
    risk_mode: Option<String>,
    risk_score: Option<i64>,
    result_ref: Option<String>,
}

impl RequestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            server: row.get(3)?,
            tool: row.get(4)?,
            env: row.get(5)?,
            args_json: row.get(6)?,
            args_hash: row.get(7)?,
            actor: row.get(8)?,
            status: row.get(9)?,
            risk_mode: row.get(10)?,
            risk_score: row.get(11)?,
            result_ref: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<RequestRecord, LedgerError> {
        let created_at = parse_time(&self.created_at)?;
        let updated_at = match &self.updated_at {
            Some(text) => parse_time(text)?,
            None => created_at,
        };
        Ok(RequestRecord {
            id: self.id,
            created_at,
            updated_at,
            server: self.server,
            tool: self.tool,
            env: self.env,
            args: serde_json::from_str(&self.args_json)?,
            args_hash: self.args_hash,
            actor: self.actor,
            status: self.status.parse()?,
            risk_mode: self.risk_mode,
            risk_score: self.risk_score,
            result_ref: self.result_ref,
        })
    }
}

struct DecisionRow {
    id: String,
    request_id: String,
    decided_at: String,
    decision: String,
    matched_policy_id: Option<String>,
    condition: Option<String>,
    reason: String,
    decided_by: Option<String>,
}

impl DecisionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            decided_at: row.get(2)?,
            decision: row.get(3)?,
            matched_policy_id: row.get(4)?,
            condition: row.get(5)?,
            reason: row.get(6)?,
            decided_by: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<DecisionRecord, LedgerError> {
        Ok(DecisionRecord {
            id: self.id,
            request_id: self.request_id,
            decided_at: parse_time(&self.decided_at)?,
            decision: self.decision.parse()?,
            matched_policy_id: self.matched_policy_id,
            condition: self.condition,
            reason: self.reason,
            decided_by: self.decided_by,
        })
    }
}

struct EventRow {
    seq: i64,
    id: String,
    created_at: String,
    request_id: Option<String>,
    kind: String,
    payload_json: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            created_at: row.get(2)?,
            request_id: row.get(3)?,
            kind: row.get(4)?,
            payload_json: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<EventRecord, LedgerError> {
        Ok(EventRecord {
            seq: self.seq,
            id: self.id,
            created_at: parse_time(&self.created_at)?,
            request_id: self.request_id,
            kind: self.kind,
            payload: serde_json::from_str(&self.payload_json)?,
        })
    }
}
