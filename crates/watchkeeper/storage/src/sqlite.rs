//! SQLite adapter for the audit memory.
//!
//! Each table has an `INTEGER PRIMARY KEY AUTOINCREMENT` sequence column that
//! records insertion order. Structured fields (summary, deliverables, skip
//! details, metadata) are stored as JSON text, so adding a field to a record
//! type only requires `#[serde(default)]` on the Rust side. Column-level
//! changes go through `MIGRATIONS`, applied in order and tracked with
//! `PRAGMA user_version`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use watchkeeper_types::{
    ActionId, ContextEntry, Decision, DecisionId, DecisionKind, Fingerprint, Run, RunId, RunKind,
    RunSummary, SkipDetails, Trigger, TriggerId, TriggerKind,
};

use crate::metrics::AuditStatistics;
use crate::model::{DecisionAppend, QueryWindow, RunAppend, SkipAppend, TriggerAppend};
use crate::traits::AuditMemory;
use crate::{StorageError, StorageResult};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS wk_runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        timestamp TEXT NOT NULL,
        trigger_reason TEXT NOT NULL,
        kind TEXT NOT NULL,
        summary TEXT NOT NULL,
        deliverables TEXT NOT NULL,
        skip TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wk_decisions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        run_id TEXT NOT NULL,
        action_id TEXT NOT NULL,
        decision TEXT NOT NULL,
        comment TEXT,
        validated_by TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wk_triggers (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        reason TEXT NOT NULL,
        source_id TEXT,
        fingerprint TEXT,
        metadata TEXT NOT NULL,
        saved_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wk_context (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Ordered column-level migrations. Index `i` upgrades `user_version` from
/// `i` to `i + 1`.
const MIGRATIONS: [&str; 1] =
    ["CREATE INDEX IF NOT EXISTS wk_runs_timestamp ON wk_runs (timestamp DESC, seq DESC)"];

const RUN_COLUMNS: &str = "seq, id, timestamp, trigger_reason, kind, summary, deliverables, skip";
const DECISION_COLUMNS: &str =
    "id, run_id, action_id, decision, comment, validated_by, timestamp";
const TRIGGER_COLUMNS: &str =
    "id, kind, reason, source_id, fingerprint, metadata, saved_at";

/// SQLite-backed audit memory.
#[derive(Clone)]
pub struct SqliteAuditMemory {
    pool: SqlitePool,
}

impl SqliteAuditMemory {
    /// Open (creating if missing) the database at `url` and initialize the
    /// schema. `sqlite::memory:` opens a private in-memory database.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::InvalidInput(format!("invalid sqlite url {url}: {e}")))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // One connection for in-memory databases, each connection would
        // otherwise see its own empty database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to open sqlite: {e}")))?;

        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let applied = usize::try_from(version).unwrap_or(0);
        for (index, stmt) in MIGRATIONS.iter().enumerate().skip(applied) {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema migration failed: {e}")))?;
            sqlx::query(&format!("PRAGMA user_version = {}", index + 1))
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            tracing::info!(version = index + 1, "Applied audit schema migration");
        }
        Ok(())
    }

    async fn insert_run(&self, run: Run) -> StorageResult<Run> {
        let summary = serde_json::to_string(&run.summary)?;
        let deliverables = serde_json::to_string(&run.deliverables)?;
        let skip = run.skip.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO wk_runs (id, timestamp, trigger_reason, kind, summary, deliverables, skip)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(run.id.as_str())
        .bind(encode_ts(run.timestamp))
        .bind(&run.trigger_reason)
        .bind(run.kind.as_str())
        .bind(summary)
        .bind(deliverables)
        .bind(skip)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        let sequence = u64::try_from(result.last_insert_rowid())
            .map_err(|_| StorageError::InvariantViolation("negative run sequence".to_string()))?;
        Ok(Run { sequence, ..run })
    }

    async fn count(&self, sql: &str) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl AuditMemory for SqliteAuditMemory {
    async fn save_run(&self, run: RunAppend) -> StorageResult<Run> {
        run.validate()?;
        self.insert_run(Run {
            id: RunId::generate(),
            sequence: 0,
            timestamp: run.timestamp.trunc_subsecs(6),
            trigger_reason: run.trigger_reason,
            kind: RunKind::Complete,
            summary: run.summary,
            deliverables: run.deliverables,
            skip: None,
        })
        .await
    }

    async fn save_skip(&self, skip: SkipAppend) -> StorageResult<Run> {
        skip.validate()?;
        self.insert_run(Run {
            id: RunId::generate(),
            sequence: 0,
            timestamp: skip.timestamp.trunc_subsecs(6),
            trigger_reason: skip.trigger_reason,
            kind: RunKind::Skipped,
            summary: skip.summary,
            deliverables: Value::Null,
            skip: Some(SkipDetails {
                reason: skip.reason,
                severity: skip.severity,
                context_summary: skip.context_summary,
            }),
        })
        .await
    }

    async fn get_last_run(&self) -> StorageResult<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM wk_runs ORDER BY timestamp DESC, seq DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|row| run_from_row(&row)).transpose()
    }

    async fn list_runs(&self, window: QueryWindow) -> StorageResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM wk_runs ORDER BY timestamp DESC, seq DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(sql_limit(window.limit)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(run_from_row).collect()
    }

    async fn save_decision(&self, decision: DecisionAppend) -> StorageResult<Decision> {
        decision.validate()?;
        let record = Decision {
            id: DecisionId::generate(),
            run_id: decision.run_id,
            action_id: decision.action_id,
            decision: decision.decision,
            comment: decision.comment,
            validated_by: decision.validated_by,
            timestamp: decision.timestamp.trunc_subsecs(6),
        };

        sqlx::query(
            r#"
            INSERT INTO wk_decisions (id, run_id, action_id, decision, comment, validated_by, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.run_id.as_str())
        .bind(record.action_id.as_str())
        .bind(record.decision.as_str())
        .bind(record.comment.as_deref())
        .bind(&record.validated_by)
        .bind(encode_ts(record.timestamp))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        Ok(record)
    }

    async fn get_decisions_for_run(&self, run_id: &RunId) -> StorageResult<Vec<Decision>> {
        let rows = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM wk_decisions WHERE run_id = ?1 ORDER BY seq ASC"
        ))
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(decision_from_row).collect()
    }

    async fn save_trigger(&self, trigger: TriggerAppend) -> StorageResult<Trigger> {
        let record = Trigger {
            id: TriggerId::generate(),
            kind: trigger.kind,
            reason: trigger.reason,
            source_id: trigger.source_id,
            fingerprint: trigger.fingerprint,
            metadata: trigger.metadata,
            saved_at: Utc::now().trunc_subsecs(6),
        };

        sqlx::query(
            r#"
            INSERT INTO wk_triggers (id, kind, reason, source_id, fingerprint, metadata, saved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.kind.as_str())
        .bind(&record.reason)
        .bind(record.source_id.as_deref())
        .bind(record.fingerprint.as_ref().map(|fp| fp.as_str().to_string()))
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(encode_ts(record.saved_at))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        Ok(record)
    }

    async fn list_triggers(&self, window: QueryWindow) -> StorageResult<Vec<Trigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM wk_triggers ORDER BY seq DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(sql_limit(window.limit)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn upsert_context(&self, key: &str, value: Value) -> StorageResult<ContextEntry> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "context key must not be empty".to_string(),
            ));
        }
        let entry = ContextEntry {
            key: key.to_string(),
            value,
            updated_at: Utc::now().trunc_subsecs(6),
        };

        sqlx::query(
            r#"
            INSERT INTO wk_context (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.key)
        .bind(serde_json::to_string(&entry.value)?)
        .bind(encode_ts(entry.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(entry)
    }

    async fn get_context_entry(&self, key: &str) -> StorageResult<Option<ContextEntry>> {
        let row = sqlx::query("SELECT key, value, updated_at FROM wk_context WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|row| -> StorageResult<ContextEntry> {
            Ok(ContextEntry {
                key: get(&row, "key")?,
                value: serde_json::from_str(&get::<String>(&row, "value")?)?,
                updated_at: decode_ts(&get::<String>(&row, "updated_at")?)?,
            })
        })
        .transpose()
    }

    async fn get_statistics(&self) -> StorageResult<AuditStatistics> {
        let total_runs = self.count("SELECT COUNT(*) FROM wk_runs").await?;
        let complete_runs = self
            .count("SELECT COUNT(*) FROM wk_runs WHERE kind = 'complete'")
            .await?;
        let decisions = self.count("SELECT COUNT(*) FROM wk_decisions").await?;
        let triggers = self.count("SELECT COUNT(*) FROM wk_triggers").await?;
        let context_entries = self.count("SELECT COUNT(*) FROM wk_context").await?;
        let last_run_at = self.get_last_run().await?.map(|run| run.timestamp);

        Ok(AuditStatistics {
            total_runs,
            complete_runs,
            skipped_runs: total_runs.saturating_sub(complete_runs),
            decisions,
            triggers,
            context_entries,
            last_run_at,
        })
    }

    async fn prune(&self, keep_last_n: usize) -> StorageResult<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM wk_runs
             WHERE seq NOT IN (
                SELECT seq FROM wk_runs
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT ?1
             )
            "#,
        )
        .bind(to_i64(keep_last_n)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let removed = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        tracing::debug!(removed, kept = keep_last_n, "Pruned run history");
        Ok(removed)
    }
}

fn run_from_row(row: &SqliteRow) -> StorageResult<Run> {
    let kind_raw: String = get(row, "kind")?;
    let kind = RunKind::parse(&kind_raw)
        .ok_or_else(|| StorageError::Serialization(format!("unknown run kind {kind_raw}")))?;
    let summary: RunSummary = serde_json::from_str(&get::<String>(row, "summary")?)?;
    let deliverables: Value = serde_json::from_str(&get::<String>(row, "deliverables")?)?;
    let skip: Option<SkipDetails> = get::<Option<String>>(row, "skip")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let sequence = u64::try_from(get::<i64>(row, "seq")?)
        .map_err(|_| StorageError::InvariantViolation("negative run sequence".to_string()))?;

    Ok(Run {
        id: RunId::new(get::<String>(row, "id")?),
        sequence,
        timestamp: decode_ts(&get::<String>(row, "timestamp")?)?,
        trigger_reason: get(row, "trigger_reason")?,
        kind,
        summary,
        deliverables,
        skip,
    })
}

fn decision_from_row(row: &SqliteRow) -> StorageResult<Decision> {
    let raw: String = get(row, "decision")?;
    let decision = DecisionKind::parse(&raw)
        .ok_or_else(|| StorageError::Serialization(format!("unknown decision {raw}")))?;

    Ok(Decision {
        id: DecisionId::new(get::<String>(row, "id")?),
        run_id: RunId::new(get::<String>(row, "run_id")?),
        action_id: ActionId::new(get::<String>(row, "action_id")?),
        decision,
        comment: get(row, "comment")?,
        validated_by: get(row, "validated_by")?,
        timestamp: decode_ts(&get::<String>(row, "timestamp")?)?,
    })
}

fn trigger_from_row(row: &SqliteRow) -> StorageResult<Trigger> {
    let raw: String = get(row, "kind")?;
    let kind: TriggerKind = serde_json::from_value(Value::String(raw))?;

    Ok(Trigger {
        id: TriggerId::new(get::<String>(row, "id")?),
        kind,
        reason: get(row, "reason")?,
        source_id: get(row, "source_id")?,
        fingerprint: get::<Option<String>>(row, "fingerprint")?.map(Fingerprint::new),
        metadata: serde_json::from_str(&get::<String>(row, "metadata")?)?,
        saved_at: decode_ts(&get::<String>(row, "saved_at")?)?,
    })
}

fn get<T>(row: &SqliteRow, column: &str) -> StorageResult<T>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| StorageError::Backend(format!("column {column}: {e}")))
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {raw}: {e}")))
}

/// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: usize) -> StorageResult<i64> {
    if limit == 0 {
        Ok(-1)
    } else {
        to_i64(limit)
    }
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput(format!("value {value} exceeds i64 range")))
}

fn map_sqlx_conflict(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(db.message().to_string())
        }
        _ => StorageError::Backend(e.to_string()),
    }
}
