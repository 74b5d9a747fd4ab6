//! Database migrations
//!
//! This module manages SQLite schema migrations for relgraph.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Documents and identities
const MIGRATION_V1: &str = r#"
    -- Registry of ingested documents
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_id TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        structured_fields TEXT NOT NULL DEFAULT '{}',
        chunk_refs TEXT NOT NULL DEFAULT '[]',
        content_hash TEXT NOT NULL,
        ingested_at TEXT NOT NULL,
        UNIQUE(workspace_id, source_type, source_id)
    );

    CREATE INDEX IF NOT EXISTS idx_documents_workspace ON documents(workspace_id, ingested_at);

    -- Last extraction pass per document
    CREATE TABLE IF NOT EXISTS extraction_state (
        document_id TEXT PRIMARY KEY NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        rule_version INTEGER NOT NULL,
        semantic_status TEXT NOT NULL CHECK (semantic_status IN ('pending', 'done', 'skipped', 'not_applicable')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        processed_at TEXT NOT NULL
    );

    -- Canonical entities
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        display_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entities_workspace ON entities(workspace_id, kind);

    -- Aliases; the uniqueness constraint is what makes resolution race-safe
    CREATE TABLE IF NOT EXISTS entity_aliases (
        id TEXT PRIMARY KEY NOT NULL,
        entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        workspace_id TEXT NOT NULL,
        alias_type TEXT NOT NULL CHECK (alias_type IN ('provider_id', 'email', 'handle')),
        value TEXT NOT NULL,
        provider TEXT,
        verified INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE(workspace_id, alias_type, value)
    );

    CREATE INDEX IF NOT EXISTS idx_entity_aliases_entity ON entity_aliases(entity_id);

    -- Heuristic identity matches awaiting an admin decision
    CREATE TABLE IF NOT EXISTS merge_suggestions (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        candidate_entity_id TEXT NOT NULL,
        confidence REAL NOT NULL,
        signals TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL CHECK (status IN ('open', 'conflicted', 'applied', 'dismissed')),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(workspace_id, entity_id, candidate_entity_id)
    );
"#;

/// Migration 2: Relationship store
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS relationships (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        from_kind TEXT NOT NULL CHECK (from_kind IN ('document', 'entity')),
        from_id TEXT NOT NULL,
        to_kind TEXT NOT NULL CHECK (to_kind IN ('document', 'entity')),
        to_id TEXT NOT NULL,
        relationship_type TEXT NOT NULL,
        confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        source TEXT NOT NULL CHECK (source IN ('deterministic', 'semantic', 'manual')),
        status TEXT NOT NULL DEFAULT 'resolved',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(workspace_id, from_id, to_id, relationship_type, source)
    );

    CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(workspace_id, from_id);
    CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(workspace_id, to_id);

    CREATE TABLE IF NOT EXISTS relationship_evidence (
        id TEXT PRIMARY KEY NOT NULL,
        relationship_id TEXT NOT NULL REFERENCES relationships(id) ON DELETE CASCADE,
        quote TEXT NOT NULL,
        chunk_ref TEXT,
        reasoning TEXT NOT NULL,
        weight REAL NOT NULL,
        rule TEXT,
        fingerprint TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(relationship_id, fingerprint)
    );

    -- Accepted proposals whose target document has not arrived yet
    CREATE TABLE IF NOT EXISTS pending_relationships (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        from_document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        target_source_type TEXT NOT NULL,
        target_source_id TEXT NOT NULL,
        relationship_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        source TEXT NOT NULL,
        evidence TEXT NOT NULL DEFAULT '[]',
        retry_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL CHECK (status IN ('waiting', 'retrying')),
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(workspace_id, from_document_id, target_source_type, target_source_id, relationship_type, source)
    );

    CREATE INDEX IF NOT EXISTS idx_pending_target
        ON pending_relationships(workspace_id, target_source_type, target_source_id);

    -- Proposals in the review band
    CREATE TABLE IF NOT EXISTS review_queue (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        from_kind TEXT NOT NULL,
        from_id TEXT NOT NULL,
        to_kind TEXT NOT NULL,
        to_id TEXT NOT NULL,
        relationship_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        source TEXT NOT NULL,
        evidence TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL CHECK (status IN ('open', 'approved', 'rejected')),
        created_at TEXT NOT NULL,
        decided_at TEXT,
        UNIQUE(workspace_id, from_id, to_id, relationship_type)
    );

    CREATE INDEX IF NOT EXISTS idx_review_queue_status ON review_queue(workspace_id, status);
"#;

/// Migration 3: Audit trail, dead letters and backfill runs
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        subject_ids TEXT NOT NULL DEFAULT '[]',
        reason TEXT NOT NULL DEFAULT '',
        outcome TEXT NOT NULL CHECK (outcome IN ('success', 'failure')),
        detail TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_log_workspace ON audit_log(workspace_id, created_at);

    CREATE TABLE IF NOT EXISTS dead_letters (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        document_id TEXT,
        stage TEXT NOT NULL,
        error TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dead_letters_workspace ON dead_letters(workspace_id, created_at);

    CREATE TABLE IF NOT EXISTS backfill_runs (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        filter TEXT NOT NULL DEFAULT '{}',
        scanned INTEGER NOT NULL DEFAULT 0,
        processed INTEGER NOT NULL DEFAULT 0,
        created INTEGER NOT NULL DEFAULT 0,
        skipped INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        failures TEXT NOT NULL DEFAULT '[]',
        started_at TEXT NOT NULL,
        finished_at TEXT
    );
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let (version,): (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Documents and identities");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Relationship store");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Audit trail and backfill runs");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
