#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-store-sqlite** – SQLite implementation of the triangulum
//! coordination core's storage traits.
//!
//! A single connection pool backs eight tables: `runs`, `files`, `pois`,
//! `relationships`, `relationship_evidence`, `outbox_events`, `checkpoints`,
//! and `schema_migrations`. All writes that must be atomic with an outbox
//! append go through a single `sqlx` transaction, mirroring the
//! payload/header co-commit used by this crate's upstream event-store
//! ancestor.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use triangulum_store_core::{
    CheckpointStore, EvidenceStore, FileStore, Migration, OutboxStore, PoiStore, RelationshipStore,
    RunStore, StoreError,
};
use triangulum_types::{
    Checkpoint, CheckpointId, CheckpointStatus, EventType, FileRecord, FileStatus, Origin, OutboxEvent,
    OutboxEventId, OutboxEventStatus, Poi, PoiId, PoiKind, Relationship, RelationshipEvidence,
    RelationshipHash, RelationshipId, RelationshipStatus, RelationshipType, Run, RunId, RunStatus,
    Stage, ValidationResult,
};

/// Forward-only schema, applied in order on every open.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "runs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                status TEXT NOT NULL
            ) STRICT
        "#,
    },
    Migration {
        version: 2,
        name: "files",
        sql: r#"
            CREATE TABLE IF NOT EXISTS files (
                run TEXT NOT NULL REFERENCES runs(id),
                path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (run, path)
            ) STRICT
        "#,
    },
    Migration {
        version: 3,
        name: "pois",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pois (
                id INTEGER NOT NULL,
                run TEXT NOT NULL REFERENCES runs(id),
                file_path TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                is_exported INTEGER,
                semantic_id TEXT,
                llm_payload TEXT,
                PRIMARY KEY (run, id)
            ) STRICT;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_pois_semantic_id ON pois(run, semantic_id);
            CREATE INDEX IF NOT EXISTS idx_pois_run ON pois(run);
        "#,
    },
    Migration {
        version: 4,
        name: "relationships",
        sql: r#"
            CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER NOT NULL,
                run TEXT NOT NULL REFERENCES runs(id),
                source INTEGER NOT NULL,
                target INTEGER NOT NULL,
                rel_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL,
                file_path TEXT,
                cross_file INTEGER NOT NULL,
                reason TEXT,
                PRIMARY KEY (run, id)
            ) STRICT;
            CREATE INDEX IF NOT EXISTS idx_relationships_run ON relationships(run);
        "#,
    },
    Migration {
        version: 5,
        name: "relationship_evidence",
        sql: r#"
            CREATE TABLE IF NOT EXISTS relationship_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run TEXT NOT NULL REFERENCES runs(id),
                relationship_hash BLOB NOT NULL,
                payload TEXT NOT NULL,
                relationship_id INTEGER,
                created_at TEXT NOT NULL
            ) STRICT;
            CREATE INDEX IF NOT EXISTS idx_evidence_hash ON relationship_evidence(run, relationship_hash);
        "#,
    },
    Migration {
        version: 6,
        name: "outbox_events",
        sql: r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run TEXT NOT NULL REFERENCES runs(id),
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                origin TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            ) STRICT;
            CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_events(run, status, id);
        "#,
    },
    Migration {
        version: 7,
        name: "checkpoints",
        sql: r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run TEXT NOT NULL REFERENCES runs(id),
                stage TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                validation_result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            ) STRICT;
            CREATE INDEX IF NOT EXISTS idx_checkpoints_entity ON checkpoints(run, stage, entity_id);
        "#,
    },
];

/// SQLite-backed implementation of every storage trait in
/// `triangulum-store-core`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database file, applying migrations and the pragmas
    /// the coordination core relies on (WAL journaling, foreign keys,
    /// `synchronous = NORMAL`).
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database, for tests and scripted runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying pragmas and migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await.ok();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY) STRICT"#,
        )
        .execute(&self.pool)
        .await?;

        for migration in MIGRATIONS {
            let applied: Option<i64> =
                sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = ?")
                    .bind(migration.version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }
            tracing::debug!(version = migration.version, name = migration.name, "applying migration");
            for statement in migration.sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&self.pool).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
                .bind(migration.version)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn next_poi_id(&self, tx: &mut Transaction<'_, Sqlite>, run: &RunId) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM pois WHERE run = ?")
            .bind(run.to_string())
            .fetch_one(&mut **tx)
            .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn next_relationship_id(&self, tx: &mut Transaction<'_, Sqlite>, run: &RunId) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM relationships WHERE run = ?")
                .bind(run.to_string())
                .fetch_one(&mut **tx)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn poi_kind_from_str(s: &str) -> Result<PoiKind> {
    Ok(match s {
        "function" => PoiKind::Function,
        "class" => PoiKind::Class,
        "method" => PoiKind::Method,
        "variable" => PoiKind::Variable,
        "import" => PoiKind::Import,
        "export" => PoiKind::Export,
        "interface" => PoiKind::Interface,
        "type" => PoiKind::Type,
        "constant" => PoiKind::Constant,
        "module" => PoiKind::Module,
        other => anyhow::bail!("unknown poi kind in storage: {other}"),
    })
}

fn event_type_from_str(s: &str) -> Result<EventType> {
    Ok(match s {
        "file-analysis-finding" => EventType::FileAnalysisFinding,
        "relationship-analysis-finding" => EventType::RelationshipAnalysisFinding,
        "global-relationship-analysis-finding" => EventType::GlobalRelationshipAnalysisFinding,
        "directory-summary" => EventType::DirectorySummary,
        "failed-job" => EventType::FailedJob,
        other => anyhow::bail!("unknown event type in storage: {other}"),
    })
}

fn origin_as_str(origin: Origin) -> &'static str {
    match origin {
        Origin::FileAnalysis => "file_analysis",
        Origin::RelationshipResolution => "relationship_resolution",
        Origin::GlobalAnalysis => "global_analysis",
        Origin::Triangulation => "triangulation",
    }
}

fn stage_as_str(stage: Stage) -> &'static str {
    match stage {
        Stage::FileLoaded => "file_loaded",
        Stage::EntitiesExtracted => "entities_extracted",
        Stage::RelationshipsBuilt => "relationships_built",
        Stage::Neo4jStored => "neo4j_stored",
        Stage::PipelineComplete => "pipeline_complete",
    }
}

fn stage_from_str(s: &str) -> Result<Stage> {
    Ok(match s {
        "file_loaded" => Stage::FileLoaded,
        "entities_extracted" => Stage::EntitiesExtracted,
        "relationships_built" => Stage::RelationshipsBuilt,
        "neo4j_stored" => Stage::Neo4jStored,
        "pipeline_complete" => Stage::PipelineComplete,
        other => anyhow::bail!("unknown stage in storage: {other}"),
    })
}

//─────────────────────────────
//  RunStore
//─────────────────────────────

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query("INSERT INTO runs (id, started_at, status) VALUES (?, ?, ?)")
            .bind(run.id.to_string())
            .bind(run.started_at.to_rfc3339())
            .bind(run_status_as_str(run.status))
            .execute(&self.pool)
            .await
            .context("inserting run")?;
        Ok(())
    }

    async fn finalize_run(&self, id: &RunId, status: RunStatus) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET status = ? WHERE id = ?")
            .bind(run_status_as_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT id, started_at, status FROM runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Run {
                id: RunId::new(row.get::<String, _>("id"))?,
                started_at: parse_rfc3339(&row.get::<String, _>("started_at"))?,
                status: run_status_from_str(&row.get::<String, _>("status"))?,
            })
        })
        .transpose()
    }
}

fn run_status_as_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Active => "active",
        RunStatus::Finalized => "finalized",
        RunStatus::Failed => "failed",
    }
}

fn run_status_from_str(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "active" => RunStatus::Active,
        "finalized" => RunStatus::Finalized,
        "failed" => RunStatus::Failed,
        other => anyhow::bail!("unknown run status in storage: {other}"),
    })
}

//─────────────────────────────
//  FileStore
//─────────────────────────────

fn file_status_as_str(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Pending => "pending",
        FileStatus::Processing => "processing",
        FileStatus::Analyzed => "analyzed",
        FileStatus::Failed => "failed",
    }
}

fn file_status_from_str(s: &str) -> Result<FileStatus> {
    Ok(match s {
        "pending" => FileStatus::Pending,
        "processing" => FileStatus::Processing,
        "analyzed" => FileStatus::Analyzed,
        "failed" => FileStatus::Failed,
        other => anyhow::bail!("unknown file status in storage: {other}"),
    })
}

#[async_trait]
impl FileStore for SqliteStore {
    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (run, path, content_hash, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run, path) DO UPDATE SET
                status = CASE
                    WHEN content_hash != excluded.content_hash THEN 'pending'
                    ELSE status
                END,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(file.run.to_string())
        .bind(&file.path)
        .bind(&file.content_hash)
        .bind(file_status_as_str(file.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_file_status(&self, run: &RunId, path: &str, status: FileStatus) -> Result<()> {
        sqlx::query("UPDATE files SET status = ? WHERE run = ? AND path = ?")
            .bind(file_status_as_str(status))
            .bind(run.to_string())
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_file(&self, run: &RunId, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT run, path, content_hash, status FROM files WHERE run = ? AND path = ?")
            .bind(run.to_string())
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_file_record).transpose()
    }

    async fn list_files_for_run(&self, run: &RunId) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT run, path, content_hash, status FROM files WHERE run = ? ORDER BY path")
            .bind(run.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_file_record).collect()
    }
}

fn row_to_file_record(row: sqlx::sqlite::SqliteRow) -> Result<FileRecord> {
    Ok(FileRecord {
        run: RunId::new(row.get::<String, _>("run"))?,
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        status: file_status_from_str(&row.get::<String, _>("status"))?,
    })
}

//─────────────────────────────
//  PoiStore
//─────────────────────────────

#[async_trait]
impl PoiStore for SqliteStore {
    async fn insert_poi(&self, poi: &Poi) -> Result<PoiId> {
        poi.validate().map_err(|e| anyhow::anyhow!(e))?;
        let mut tx = self.pool.begin().await?;
        let id = self.next_poi_id(&mut tx, &poi.run).await?;

        sqlx::query(
            r#"
            INSERT INTO pois (id, run, file_path, kind, name, start_line, end_line, is_exported, semantic_id, llm_payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(poi.run.to_string())
        .bind(&poi.file_path)
        .bind(poi.kind.as_str())
        .bind(&poi.name)
        .bind(poi.start_line as i64)
        .bind(poi.end_line as i64)
        .bind(poi.is_exported.map(|b| b as i64))
        .bind(&poi.semantic_id)
        .bind(poi.llm_payload.as_ref().map(|v| v.to_string()))
        .execute(&mut *tx)
        .await
        .context("inserting poi")?;

        tx.commit().await?;
        Ok(PoiId(id))
    }

    async fn get_poi(&self, run: &RunId, id: PoiId) -> Result<Option<Poi>> {
        let row = sqlx::query(
            "SELECT id, run, file_path, kind, name, start_line, end_line, is_exported, semantic_id, llm_payload FROM pois WHERE run = ? AND id = ?",
        )
        .bind(run.to_string())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_poi).transpose()
    }

    async fn find_by_semantic_id(&self, run: &RunId, semantic_id: &str) -> Result<Option<Poi>> {
        let row = sqlx::query(
            "SELECT id, run, file_path, kind, name, start_line, end_line, is_exported, semantic_id, llm_payload FROM pois WHERE run = ? AND semantic_id = ?",
        )
        .bind(run.to_string())
        .bind(semantic_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_poi).transpose()
    }

    async fn list_pois_for_run(&self, run: &RunId) -> Result<Vec<Poi>> {
        let rows = sqlx::query(
            "SELECT id, run, file_path, kind, name, start_line, end_line, is_exported, semantic_id, llm_payload FROM pois WHERE run = ? ORDER BY id",
        )
        .bind(run.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_poi).collect()
    }
}

fn row_to_poi(row: sqlx::sqlite::SqliteRow) -> Result<Poi> {
    let llm_payload: Option<String> = row.get("llm_payload");
    Ok(Poi {
        id: PoiId(row.get("id")),
        run: RunId::new(row.get::<String, _>("run"))?,
        file_path: row.get("file_path"),
        kind: poi_kind_from_str(&row.get::<String, _>("kind"))?,
        name: row.get("name"),
        start_line: row.get::<i64, _>("start_line") as u32,
        end_line: row.get::<i64, _>("end_line") as u32,
        is_exported: row.get::<Option<i64>, _>("is_exported").map(|v| v != 0),
        semantic_id: row.get("semantic_id"),
        llm_payload: llm_payload.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

//─────────────────────────────
//  RelationshipStore
//─────────────────────────────

#[async_trait]
impl RelationshipStore for SqliteStore {
    async fn insert_relationship(&self, rel: &Relationship) -> Result<RelationshipId> {
        let mut tx = self.pool.begin().await?;
        let id = self.next_relationship_id(&mut tx, &rel.run).await?;

        sqlx::query(
            r#"
            INSERT INTO relationships (id, run, source, target, rel_type, confidence, status, file_path, cross_file, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(rel.run.to_string())
        .bind(rel.source.0)
        .bind(rel.target.0)
        .bind(rel.rel_type.as_str())
        .bind(rel.confidence)
        .bind(relationship_status_as_str(rel.status))
        .bind(&rel.file_path)
        .bind(rel.cross_file as i64)
        .bind(&rel.reason)
        .execute(&mut *tx)
        .await
        .context("inserting relationship")?;

        tx.commit().await?;
        Ok(RelationshipId(id))
    }

    async fn update_status(&self, run: &RunId, id: RelationshipId, status: RelationshipStatus) -> Result<()> {
        let result = sqlx::query("UPDATE relationships SET status = ? WHERE run = ? AND id = ?")
            .bind(relationship_status_as_str(status))
            .bind(run.to_string())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "relationship",
                id: id.0.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn get_relationship(&self, run: &RunId, id: RelationshipId) -> Result<Option<Relationship>> {
        let row = sqlx::query(
            "SELECT id, run, source, target, rel_type, confidence, status, file_path, cross_file, reason FROM relationships WHERE run = ? AND id = ?",
        )
        .bind(run.to_string())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_relationship).transpose()
    }

    async fn list_relationships_for_run(&self, run: &RunId) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            "SELECT id, run, source, target, rel_type, confidence, status, file_path, cross_file, reason FROM relationships WHERE run = ? ORDER BY id",
        )
        .bind(run.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_relationship).collect()
    }
}

fn relationship_status_as_str(status: RelationshipStatus) -> &'static str {
    match status {
        RelationshipStatus::Pending => "pending",
        RelationshipStatus::Validated => "validated",
        RelationshipStatus::TriangulatedValidated => "triangulated-validated",
        RelationshipStatus::CrossFileValidated => "cross-file-validated",
        RelationshipStatus::Rejected => "rejected",
        RelationshipStatus::Escalated => "escalated",
    }
}

fn relationship_status_from_str(s: &str) -> Result<RelationshipStatus> {
    Ok(match s {
        "pending" => RelationshipStatus::Pending,
        "validated" => RelationshipStatus::Validated,
        "triangulated-validated" => RelationshipStatus::TriangulatedValidated,
        "cross-file-validated" => RelationshipStatus::CrossFileValidated,
        "rejected" => RelationshipStatus::Rejected,
        "escalated" => RelationshipStatus::Escalated,
        other => anyhow::bail!("unknown relationship status in storage: {other}"),
    })
}

fn row_to_relationship(row: sqlx::sqlite::SqliteRow) -> Result<Relationship> {
    Ok(Relationship {
        id: RelationshipId(row.get("id")),
        run: RunId::new(row.get::<String, _>("run"))?,
        source: PoiId(row.get("source")),
        target: PoiId(row.get("target")),
        rel_type: RelationshipType::from_str(&row.get::<String, _>("rel_type")).map_err(|e| anyhow::anyhow!(e))?,
        confidence: row.get("confidence"),
        status: relationship_status_from_str(&row.get::<String, _>("status"))?,
        file_path: row.get("file_path"),
        cross_file: row.get::<i64, _>("cross_file") != 0,
        reason: row.get("reason"),
    })
}

//─────────────────────────────
//  EvidenceStore
//─────────────────────────────

#[async_trait]
impl EvidenceStore for SqliteStore {
    async fn insert_evidence(&self, evidence: &RelationshipEvidence) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO relationship_evidence (run, relationship_hash, payload, relationship_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(evidence.run.to_string())
        .bind(&evidence.relationship_hash.0[..])
        .bind(evidence.payload.to_string())
        .bind(evidence.relationship_id.map(|r| r.0))
        .bind(evidence.created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("inserting evidence")?;
        Ok(row.get("id"))
    }

    async fn evidence_for_hash(&self, run: &RunId, hash: RelationshipHash) -> Result<Vec<RelationshipEvidence>> {
        let rows = sqlx::query(
            "SELECT id, run, relationship_hash, payload, relationship_id, created_at FROM relationship_evidence WHERE run = ? AND relationship_hash = ? ORDER BY id",
        )
        .bind(run.to_string())
        .bind(&hash.0[..])
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_evidence).collect()
    }

    async fn count_evidence_for_hash(&self, run: &RunId, hash: RelationshipHash) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relationship_evidence WHERE run = ? AND relationship_hash = ?",
        )
        .bind(run.to_string())
        .bind(&hash.0[..])
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn link_evidence_to_relationship(
        &self,
        run: &RunId,
        hash: RelationshipHash,
        relationship: RelationshipId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE relationship_evidence SET relationship_id = ? WHERE run = ? AND relationship_hash = ?",
        )
        .bind(relationship.0)
        .bind(run.to_string())
        .bind(&hash.0[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_evidence(row: sqlx::sqlite::SqliteRow) -> Result<RelationshipEvidence> {
    let hash_bytes: Vec<u8> = row.get("relationship_hash");
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hash_bytes);
    Ok(RelationshipEvidence {
        id: row.get("id"),
        run: RunId::new(row.get::<String, _>("run"))?,
        relationship_hash: RelationshipHash(hash),
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        relationship_id: row.get::<Option<i64>, _>("relationship_id").map(RelationshipId),
        created_at: parse_rfc3339(&row.get::<String, _>("created_at"))?,
    })
}

//─────────────────────────────
//  OutboxStore
//─────────────────────────────

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn append(&self, run: &RunId, event_type: EventType, payload: Value, origin: Origin) -> Result<OutboxEventId> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (run, event_type, payload, origin, status, created_at, retry_count)
            VALUES (?, ?, ?, ?, 'pending', ?, 0)
            RETURNING id
            "#,
        )
        .bind(run.to_string())
        .bind(event_type.as_str())
        .bind(payload.to_string())
        .bind(origin_as_str(origin))
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("appending outbox event")?;
        Ok(OutboxEventId(row.get("id")))
    }

    async fn claim_batch(&self, run: &RunId, limit: u32) -> Result<Vec<OutboxEvent>> {
        // A single UPDATE...RETURNING is the atomic unit, not a transaction
        // wrapping a SELECT-then-UPDATE: SQLite serializes writers at the
        // statement level, so two concurrent `claim_batch` calls for the
        // same run can never both flip the same row out of `pending`.
        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'in_flight'
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE run = ? AND status = 'pending'
                ORDER BY id
                LIMIT ?
            )
            RETURNING id, run, event_type, payload, status, created_at, retry_count
            "#,
        )
        .bind(run.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_outbox_event).collect()
    }

    async fn mark_published(&self, run: &RunId, id: OutboxEventId) -> Result<()> {
        sqlx::query("UPDATE outbox_events SET status = 'published' WHERE run = ? AND id = ? AND status = 'in_flight'")
            .bind(run.to_string())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, run: &RunId, id: OutboxEventId) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE outbox_events SET retry_count = retry_count + 1, status = 'pending' WHERE run = ? AND id = ? AND status = 'in_flight' RETURNING retry_count",
        )
        .bind(run.to_string())
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("retry_count") as u32)
    }

    async fn count_pending(&self, run: &RunId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_events WHERE run = ? AND status IN ('pending', 'in_flight')",
        )
        .bind(run.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn mark_terminally_failed(&self, run: &RunId, id: OutboxEventId) -> Result<()> {
        sqlx::query("UPDATE outbox_events SET status = 'failed' WHERE run = ? AND id = ?")
            .bind(run.to_string())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn status_of(&self, run: &RunId, id: OutboxEventId) -> Result<Option<OutboxEventStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM outbox_events WHERE run = ? AND id = ?")
            .bind(run.to_string())
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| outbox_status_from_str(&s)).transpose()
    }
}

fn outbox_status_from_str(s: &str) -> Result<OutboxEventStatus> {
    Ok(match s {
        "pending" => OutboxEventStatus::Pending,
        "in_flight" => OutboxEventStatus::InFlight,
        "published" => OutboxEventStatus::Published,
        "failed" => OutboxEventStatus::Failed,
        other => anyhow::bail!("unknown outbox status in storage: {other}"),
    })
}

fn row_to_outbox_event(row: sqlx::sqlite::SqliteRow) -> Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: OutboxEventId(row.get("id")),
        run: RunId::new(row.get::<String, _>("run"))?,
        event_type: event_type_from_str(&row.get::<String, _>("event_type"))?,
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        status: outbox_status_from_str(&row.get::<String, _>("status"))?,
        created_at: parse_rfc3339(&row.get::<String, _>("created_at"))?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
    })
}

//─────────────────────────────
//  CheckpointStore
//─────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn create_checkpoint(&self, run: &RunId, stage: Stage, entity_id: &str, metadata: Value) -> Result<CheckpointId> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            INSERT INTO checkpoints (run, stage, entity_id, status, metadata, validation_result, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, NULL, ?, ?)
            RETURNING id
            "#,
        )
        .bind(run.to_string())
        .bind(stage_as_str(stage))
        .bind(entity_id)
        .bind(metadata.to_string())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .context("creating checkpoint")?;
        Ok(CheckpointId(row.get("id")))
    }

    async fn update_checkpoint(&self, run: &RunId, id: CheckpointId, result: ValidationResult) -> Result<()> {
        let status = if result.valid { "completed" } else { "failed" };
        let result_json = serde_json::to_string(&result)?;
        let updated = sqlx::query(
            "UPDATE checkpoints SET status = ?, validation_result = ?, updated_at = ? WHERE run = ? AND id = ?",
        )
        .bind(status)
        .bind(result_json)
        .bind(Utc::now().to_rfc3339())
        .bind(run.to_string())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "checkpoint",
                id: id.0.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn latest_for_entity(&self, run: &RunId, stage: Stage, entity_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT id, run, stage, entity_id, status, metadata, validation_result, created_at, updated_at
            FROM checkpoints WHERE run = ? AND stage = ? AND entity_id = ? ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(run.to_string())
        .bind(stage_as_str(stage))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_checkpoint).transpose()
    }

    async fn list_for_run(&self, run: &RunId) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run, stage, entity_id, status, metadata, validation_result, created_at, updated_at
            FROM checkpoints WHERE run = ? ORDER BY id
            "#,
        )
        .bind(run.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_checkpoint).collect()
    }
}

fn checkpoint_status_from_str(s: &str) -> Result<CheckpointStatus> {
    Ok(match s {
        "pending" => CheckpointStatus::Pending,
        "completed" => CheckpointStatus::Completed,
        "failed" => CheckpointStatus::Failed,
        other => anyhow::bail!("unknown checkpoint status in storage: {other}"),
    })
}

fn row_to_checkpoint(row: sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let validation_result: Option<String> = row.get("validation_result");
    Ok(Checkpoint {
        id: CheckpointId(row.get("id")),
        run: RunId::new(row.get::<String, _>("run"))?,
        stage: stage_from_str(&row.get::<String, _>("stage"))?,
        entity_id: row.get("entity_id"),
        status: checkpoint_status_from_str(&row.get::<String, _>("status"))?,
        metadata: serde_json::from_str(&row.get::<String, _>("metadata"))?,
        validation_result: validation_result.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: parse_rfc3339(&row.get::<String, _>("created_at"))?,
        updated_at: parse_rfc3339(&row.get::<String, _>("updated_at"))?,
    })
}
