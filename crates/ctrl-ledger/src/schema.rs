// schema.rs - Versioned schema migrations.
//
// Applied once at startup by `Ledger::migrate()`. Each migration runs in its
// own transaction together with its `_migrations` row, so a crash leaves
// either the whole step or none of it.

/// (id, SQL), in application order. Never edit a shipped entry; add one.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_init", INIT),
    ("002_risk_and_approval", RISK_AND_APPROVAL),
    ("003_append_only_guards", APPEND_ONLY_GUARDS),
];

pub const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS _migrations (
    id         TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
);
";

const INIT: &str = "
CREATE TABLE requests (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL,
    server      TEXT NOT NULL,
    tool        TEXT NOT NULL,
    env         TEXT NOT NULL,
    args_json   TEXT NOT NULL,
    args_hash   TEXT NOT NULL,
    actor       TEXT,
    status      TEXT NOT NULL
);
CREATE INDEX idx_requests_status_created ON requests (status, created_at);
CREATE INDEX idx_requests_created ON requests (created_at);

CREATE TABLE decisions (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    id                TEXT NOT NULL UNIQUE,
    request_id        TEXT NOT NULL REFERENCES requests (id),
    decided_at        TEXT NOT NULL,
    decision          TEXT NOT NULL,
    matched_policy_id TEXT,
    condition         TEXT,
    reason            TEXT NOT NULL
);
CREATE INDEX idx_decisions_request ON decisions (request_id, seq);

CREATE TABLE events (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL UNIQUE,
    created_at   TEXT NOT NULL,
    request_id   TEXT REFERENCES requests (id),
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX idx_events_request ON events (request_id, seq);
";

const RISK_AND_APPROVAL: &str = "
ALTER TABLE requests ADD COLUMN updated_at TEXT;
ALTER TABLE requests ADD COLUMN risk_mode TEXT;
ALTER TABLE requests ADD COLUMN risk_score INTEGER;
ALTER TABLE requests ADD COLUMN result_ref TEXT;
ALTER TABLE decisions ADD COLUMN decided_by TEXT;
CREATE INDEX idx_requests_status_updated ON requests (status, updated_at);
";

const APPEND_ONLY_GUARDS: &str = "
CREATE TRIGGER requests_intent_immutable
BEFORE UPDATE OF id, created_at, server, tool, env, args_json, args_hash, actor ON requests
BEGIN
    SELECT RAISE(ABORT, 'requests: intent fields are immutable');
END;

CREATE TRIGGER requests_never_deleted
BEFORE DELETE ON requests
BEGIN
    SELECT RAISE(ABORT, 'requests: rows are never deleted');
END;

CREATE TRIGGER decisions_immutable
BEFORE UPDATE ON decisions
BEGIN
    SELECT RAISE(ABORT, 'decisions: rows are immutable');
END;

CREATE TRIGGER decisions_never_deleted
BEFORE DELETE ON decisions
BEGIN
    SELECT RAISE(ABORT, 'decisions: rows are never deleted');
END;

CREATE TRIGGER events_immutable
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'events: rows are immutable');
END;

CREATE TRIGGER events_never_deleted
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'events: rows are never deleted');
END;
";
