//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Commits table schema.
#[derive(Iden, Clone, Copy)]
pub enum Commits {
    Table,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "commit_id"]
    CommitId,
    #[iden = "commit_sequence"]
    CommitSequence,
    #[iden = "stream_revision"]
    StreamRevision,
    #[iden = "items"]
    Items,
    #[iden = "commit_stamp"]
    CommitStamp,
    #[iden = "headers"]
    Headers,
    #[iden = "payload"]
    Payload,
    #[iden = "checkpoint_number"]
    CheckpointNumber,
}

/// Columns read back when decoding a commit row.
pub const COMMIT_COLUMNS: [Commits; 9] = [
    Commits::TenantId,
    Commits::StreamId,
    Commits::CommitId,
    Commits::CommitSequence,
    Commits::StreamRevision,
    Commits::CommitStamp,
    Commits::Headers,
    Commits::Payload,
    Commits::CheckpointNumber,
];

/// Stream heads table schema.
#[derive(Iden, Clone, Copy)]
pub enum Streams {
    Table,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "head_revision"]
    HeadRevision,
    #[iden = "snapshot_revision"]
    SnapshotRevision,
}

/// Snapshots table schema.
#[derive(Iden, Clone, Copy)]
pub enum Snapshots {
    Table,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "stream_revision"]
    StreamRevision,
    #[iden = "payload"]
    Payload,
}

/// SQL for creating all tables.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    checkpoint_number INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    commit_id TEXT NOT NULL,
    commit_sequence INTEGER NOT NULL,
    stream_revision INTEGER NOT NULL,
    items INTEGER NOT NULL,
    commit_stamp INTEGER NOT NULL,
    headers BLOB NOT NULL,
    payload BLOB NOT NULL,
    UNIQUE (tenant_id, stream_id, commit_sequence),
    UNIQUE (tenant_id, stream_id, commit_id)
);

CREATE INDEX IF NOT EXISTS idx_commits_stream_revision ON commits(tenant_id, stream_id, stream_revision);
CREATE INDEX IF NOT EXISTS idx_commits_stamp ON commits(tenant_id, commit_stamp);

CREATE TABLE IF NOT EXISTS streams (
    tenant_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    head_revision INTEGER NOT NULL,
    snapshot_revision INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, stream_id)
);

CREATE TABLE IF NOT EXISTS snapshots (
    tenant_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    stream_revision INTEGER NOT NULL,
    payload BLOB NOT NULL,
    PRIMARY KEY (tenant_id, stream_id, stream_revision)
);
"#;

/// SQL for dropping all tables.
pub const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS snapshots;
DROP TABLE IF EXISTS streams;
DROP TABLE IF EXISTS commits;
"#;
