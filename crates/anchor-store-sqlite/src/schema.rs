//! SQL schema for the Anchor SQLite store.
//!
//! Executed once at connection startup. All timestamps are stored in the
//! fixed-width form produced by `chain::format_timestamp`, so string
//! comparison orders them correctly.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Agent ids are unique across workspaces: the genesis value of a chain is
-- derived from the id alone. Deleted agents keep their row.
CREATE TABLE IF NOT EXISTS agents (
    agent_id     TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name         TEXT NOT NULL,
    description  TEXT,
    owner        TEXT,
    team         TEXT,
    status       TEXT NOT NULL DEFAULT 'active',  -- 'active' | 'suspended' | 'deleted'
    config       TEXT NOT NULL DEFAULT '{}',
    tags         TEXT NOT NULL DEFAULT '[]',
    version      INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS agents_by_workspace ON agents (workspace_id, created_at);

CREATE TABLE IF NOT EXISTS config_versions (
    agent_id   TEXT NOT NULL REFERENCES agents(agent_id),
    version    INTEGER NOT NULL,
    config     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    created_by TEXT,
    PRIMARY KEY (agent_id, version)
);

CREATE TABLE IF NOT EXISTS policies (
    workspace_id   TEXT NOT NULL,
    subject_prefix TEXT NOT NULL,
    policy         TEXT NOT NULL,   -- camelCase policy JSON
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (workspace_id, subject_prefix)
);

CREATE TABLE IF NOT EXISTS data_entries (
    agent_id   TEXT NOT NULL REFERENCES agents(agent_id),
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT '{}',
    version    INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT,
    audit_id   TEXT NOT NULL,   -- event that authorised the last mutation
    PRIMARY KEY (agent_id, key)
);

CREATE INDEX IF NOT EXISTS data_entries_by_expiry
    ON data_entries (expires_at) WHERE expires_at IS NOT NULL;

-- The ledger. Rows are never updated or deleted; the triggers below enforce
-- it. Each (agent, previous_hash) pair is unique, so two appends can never
-- fork a chain.
CREATE TABLE IF NOT EXISTS audit_events (
    id            TEXT PRIMARY KEY,
    agent_id      TEXT NOT NULL,
    sequence      INTEGER NOT NULL,
    operation     TEXT NOT NULL,
    resource      TEXT NOT NULL,
    result        TEXT NOT NULL,   -- 'allowed' | 'blocked' | 'success'
    blocked_by    TEXT,
    timestamp     TEXT NOT NULL,
    hash          TEXT NOT NULL,
    previous_hash TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    UNIQUE (agent_id, sequence),
    UNIQUE (agent_id, previous_hash)
);

CREATE INDEX IF NOT EXISTS audit_events_by_time ON audit_events (agent_id, timestamp);

CREATE TRIGGER IF NOT EXISTS audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    agent_id      TEXT NOT NULL REFERENCES agents(agent_id),
    label         TEXT,
    metadata      TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL,
    entry_count   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS checkpoints_by_agent ON checkpoints (agent_id, created_at);

CREATE TABLE IF NOT EXISTS checkpoint_entries (
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(checkpoint_id) ON DELETE CASCADE,
    key           TEXT NOT NULL,
    value         TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    expires_at    TEXT,
    PRIMARY KEY (checkpoint_id, key)
);

CREATE TABLE IF NOT EXISTS audit_exports (
    export_id    TEXT PRIMARY KEY,
    agent_id     TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    format       TEXT NOT NULL,   -- 'json' | 'csv'
    path         TEXT NOT NULL,
    event_count  INTEGER NOT NULL,
    expires_at   TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    verification TEXT             -- JSON-encoded Verification or NULL
);

CREATE INDEX IF NOT EXISTS audit_exports_by_expiry ON audit_exports (expires_at);

PRAGMA user_version = 1;
";
