//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Conditional updates compile
//! to a single `UPDATE ... WHERE <expectation>` statement and report success
//! through the affected row count, so they are atomic without transactions.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fleet::model::{
    ActivityEvent, ChangeType, Complexity, Conflict, ConflictType, EventType, FileChange, Task,
    Worker,
};
use crate::fleet::state::{ConflictStatus, TaskStatus, WorkerStatus};
use crate::store::migrations;
use crate::store::traits::{
    ConflictExpectation, ConflictPatch, Store, TaskExpectation, TaskPatch, TaskQuery, TaskUpdate,
    UpdateOutcome, WorkerExpectation, WorkerPatch,
};

/// Tasks per INSERT statement. Each task binds one parameter per column.
const INSERT_CHUNK: usize = 500;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch_tasks(
        &self,
        op: &str,
        sql: &str,
        params: Params,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn fetch_workers(
        &self,
        op: &str,
        sql: &str,
        params: Params,
    ) -> Result<Vec<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn fetch_conflicts(
        &self,
        op: &str,
        sql: &str,
        params: Params,
    ) -> Result<Vec<Conflict>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            conflicts.push(row_to_conflict(&row)?);
        }
        Ok(conflicts)
    }

    /// Run a conditional `UPDATE` and map the affected row count.
    async fn execute_conditional(
        &self,
        op: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<UpdateOutcome, DatabaseError> {
        let changed = self
            .conn()
            .execute(sql, Params::Positional(params))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        Ok(if changed == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Conflict
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(column: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite datetime() output
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}: {s:?}")))
}

fn parse_optional_datetime(
    column: &str,
    s: &Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(|s| parse_datetime(column, s)).transpose()
}

/// Integer column narrowed to its field type.
fn narrow<T: TryFrom<i64>>(column: &str, n: i64) -> Result<T, DatabaseError> {
    T::try_from(n).map_err(|_| DatabaseError::Serialization(format!("{column}: {n} out of range")))
}

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

fn int(n: u64) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn ts(dt: &DateTime<Utc>) -> Value {
    Value::Text(fmt_ts(dt))
}

fn opt_uuid(id: Option<Uuid>) -> Value {
    match id {
        Some(id) => Value::Text(id.to_string()),
        None => Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(fmt_ts(&dt)),
        None => Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<Value, DatabaseError> {
    serde_json::to_string(value)
        .map(Value::Text)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_opt_uuid(column: &str, raw: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    raw.map(|s| parse_uuid(column, &s)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, DatabaseError> {
    raw.parse::<T>().map_err(DatabaseError::Serialization)
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Collects positional parameters and hands out their `?N` placeholders.
#[derive(Default)]
struct Binder {
    params: Vec<Value>,
}

impl Binder {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn bind_list(&mut self, values: impl IntoIterator<Item = Value>) -> String {
        values
            .into_iter()
            .map(|v| self.bind(v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, title, description, status, priority, depends_on, blocked_by, \
    file_scope, labels, required_capabilities, estimated_complexity, assigned_to, assigned_at, \
    started_at, completed_at, result_summary, error_message, tokens_used, cost_usd, duration_ms, \
    unblock_processed, created_at, updated_at, version";

const TASK_ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

const WORKER_COLUMNS: &str = "id, name, kind, status, current_task_id, last_completed_task_id, \
    capabilities, last_heartbeat, tasks_completed, tasks_failed, total_tokens_used, \
    total_cost_usd, created_at, updated_at, version";

const ACTIVITY_COLUMNS: &str = "id, worker_id, task_id, event_type, message, files_changed, \
    tokens_used, cost_usd, duration_ms, metadata, timestamp";

const CHANGE_COLUMNS: &str =
    "id, worker_id, task_id, file_path, change_type, lines_added, lines_removed, timestamp";

const CONFLICT_COLUMNS: &str = "id, conflict_type, status, worker_ids, task_ids, file_paths, \
    resolution, detected_at, resolved_at, version";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let depends_on: String = row.get(5).map_err(row_err)?;
    let blocked_by: String = row.get(6).map_err(row_err)?;
    let file_scope: String = row.get(7).map_err(row_err)?;
    let labels: String = row.get(8).map_err(row_err)?;
    let required_capabilities: String = row.get(9).map_err(row_err)?;
    let complexity: String = row.get(10).map_err(row_err)?;
    let assigned_to: Option<String> = row.get(11).map_err(row_err)?;
    let assigned_at: Option<String> = row.get(12).map_err(row_err)?;
    let started_at: Option<String> = row.get(13).map_err(row_err)?;
    let completed_at: Option<String> = row.get(14).map_err(row_err)?;
    let cost_usd: String = row.get(18).map_err(row_err)?;
    let created_at: String = row.get(21).map_err(row_err)?;
    let updated_at: String = row.get(22).map_err(row_err)?;

    Ok(Task {
        id: parse_uuid("tasks.id", &id)?,
        title: row.get(1).map_err(row_err)?,
        description: row.get(2).map_err(row_err)?,
        status: parse_enum::<TaskStatus>(&status)?,
        priority: narrow("tasks.priority", row.get::<i64>(4).map_err(row_err)?)?,
        depends_on: from_json("tasks.depends_on", &depends_on)?,
        blocked_by: from_json("tasks.blocked_by", &blocked_by)?,
        file_scope: from_json("tasks.file_scope", &file_scope)?,
        labels: from_json("tasks.labels", &labels)?,
        required_capabilities: from_json("tasks.required_capabilities", &required_capabilities)?,
        estimated_complexity: parse_enum::<Complexity>(&complexity)?,
        assigned_to: parse_opt_uuid("tasks.assigned_to", assigned_to)?,
        assigned_at: parse_optional_datetime("tasks.assigned_at", &assigned_at)?,
        started_at: parse_optional_datetime("tasks.started_at", &started_at)?,
        completed_at: parse_optional_datetime("tasks.completed_at", &completed_at)?,
        result_summary: row.get(15).map_err(row_err)?,
        error_message: row.get(16).map_err(row_err)?,
        tokens_used: to_u64(row.get(17).map_err(row_err)?),
        cost_usd: parse_decimal("tasks.cost_usd", &cost_usd)?,
        duration_ms: to_u64(row.get(19).map_err(row_err)?),
        unblock_processed: row.get::<i64>(20).map_err(row_err)? != 0,
        created_at: parse_datetime("tasks.created_at", &created_at)?,
        updated_at: parse_datetime("tasks.updated_at", &updated_at)?,
        version: to_u64(row.get(23).map_err(row_err)?),
    })
}

/// Bind every TASK_COLUMNS value of `task`, in order.
fn task_values(task: &Task) -> Result<Vec<Value>, DatabaseError> {
    Ok(vec![
        text(task.id.to_string()),
        text(task.title.as_str()),
        text(task.description.as_str()),
        text(task.status.as_str()),
        Value::Integer(i64::from(task.priority)),
        json(&task.depends_on)?,
        json(&task.blocked_by)?,
        json(&task.file_scope)?,
        json(&task.labels)?,
        json(&task.required_capabilities)?,
        text(task.estimated_complexity.as_str()),
        opt_uuid(task.assigned_to),
        opt_ts(task.assigned_at),
        opt_ts(task.started_at),
        opt_ts(task.completed_at),
        opt_text(task.result_summary.as_deref()),
        opt_text(task.error_message.as_deref()),
        int(task.tokens_used),
        text(task.cost_usd.to_string()),
        int(task.duration_ms),
        Value::Integer(i64::from(task.unblock_processed)),
        ts(&task.created_at),
        ts(&task.updated_at),
        int(task.version),
    ])
}

/// Map a libsql Row to a Worker. Column order matches WORKER_COLUMNS.
fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let current_task_id: Option<String> = row.get(4).map_err(row_err)?;
    let last_completed: Option<String> = row.get(5).map_err(row_err)?;
    let capabilities: String = row.get(6).map_err(row_err)?;
    let last_heartbeat: String = row.get(7).map_err(row_err)?;
    let total_cost: String = row.get(11).map_err(row_err)?;
    let created_at: String = row.get(12).map_err(row_err)?;
    let updated_at: String = row.get(13).map_err(row_err)?;

    Ok(Worker {
        id: parse_uuid("workers.id", &id)?,
        name: row.get(1).map_err(row_err)?,
        kind: row.get(2).map_err(row_err)?,
        status: parse_enum::<WorkerStatus>(&status)?,
        current_task_id: parse_opt_uuid("workers.current_task_id", current_task_id)?,
        last_completed_task_id: parse_opt_uuid("workers.last_completed_task_id", last_completed)?,
        capabilities: from_json("workers.capabilities", &capabilities)?,
        last_heartbeat: parse_datetime("workers.last_heartbeat", &last_heartbeat)?,
        tasks_completed: to_u64(row.get(8).map_err(row_err)?),
        tasks_failed: to_u64(row.get(9).map_err(row_err)?),
        total_tokens_used: to_u64(row.get(10).map_err(row_err)?),
        total_cost_usd: parse_decimal("workers.total_cost_usd", &total_cost)?,
        created_at: parse_datetime("workers.created_at", &created_at)?,
        updated_at: parse_datetime("workers.updated_at", &updated_at)?,
        version: to_u64(row.get(14).map_err(row_err)?),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<ActivityEvent, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let worker_id: Option<String> = row.get(1).map_err(row_err)?;
    let task_id: Option<String> = row.get(2).map_err(row_err)?;
    let event_type: String = row.get(3).map_err(row_err)?;
    let files_changed: String = row.get(5).map_err(row_err)?;
    let cost_usd: String = row.get(7).map_err(row_err)?;
    let metadata: String = row.get(9).map_err(row_err)?;
    let timestamp: String = row.get(10).map_err(row_err)?;

    Ok(ActivityEvent {
        id: parse_uuid("activity.id", &id)?,
        worker_id: parse_opt_uuid("activity.worker_id", worker_id)?,
        task_id: parse_opt_uuid("activity.task_id", task_id)?,
        event_type: parse_enum::<EventType>(&event_type)?,
        message: row.get(4).map_err(row_err)?,
        files_changed: from_json("activity.files_changed", &files_changed)?,
        tokens_used: to_u64(row.get(6).map_err(row_err)?),
        cost_usd: parse_decimal("activity.cost_usd", &cost_usd)?,
        duration_ms: to_u64(row.get(8).map_err(row_err)?),
        metadata: from_json("activity.metadata", &metadata)?,
        timestamp: parse_datetime("activity.timestamp", &timestamp)?,
    })
}

fn row_to_change(row: &libsql::Row) -> Result<FileChange, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let worker_id: String = row.get(1).map_err(row_err)?;
    let task_id: String = row.get(2).map_err(row_err)?;
    let change_type: String = row.get(4).map_err(row_err)?;
    let timestamp: String = row.get(7).map_err(row_err)?;

    Ok(FileChange {
        id: parse_uuid("changes.id", &id)?,
        worker_id: parse_uuid("changes.worker_id", &worker_id)?,
        task_id: parse_uuid("changes.task_id", &task_id)?,
        file_path: row.get(3).map_err(row_err)?,
        change_type: parse_enum::<ChangeType>(&change_type)?,
        lines_added: narrow("changes.lines_added", row.get::<i64>(5).map_err(row_err)?)?,
        lines_removed: narrow("changes.lines_removed", row.get::<i64>(6).map_err(row_err)?)?,
        timestamp: parse_datetime("changes.timestamp", &timestamp)?,
    })
}

fn row_to_conflict(row: &libsql::Row) -> Result<Conflict, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let conflict_type: String = row.get(1).map_err(row_err)?;
    let status: String = row.get(2).map_err(row_err)?;
    let worker_ids: String = row.get(3).map_err(row_err)?;
    let task_ids: String = row.get(4).map_err(row_err)?;
    let file_paths: String = row.get(5).map_err(row_err)?;
    let detected_at: String = row.get(7).map_err(row_err)?;
    let resolved_at: Option<String> = row.get(8).map_err(row_err)?;

    Ok(Conflict {
        id: parse_uuid("conflicts.id", &id)?,
        conflict_type: parse_enum::<ConflictType>(&conflict_type)?,
        status: parse_enum::<ConflictStatus>(&status)?,
        worker_ids: from_json("conflicts.worker_ids", &worker_ids)?,
        task_ids: from_json("conflicts.task_ids", &task_ids)?,
        file_paths: from_json("conflicts.file_paths", &file_paths)?,
        resolution: row.get(6).map_err(row_err)?,
        detected_at: parse_datetime("conflicts.detected_at", &detected_at)?,
        resolved_at: parse_optional_datetime("conflicts.resolved_at", &resolved_at)?,
        version: to_u64(row.get(9).map_err(row_err)?),
    })
}

// ── Conditional update builders ─────────────────────────────────────

fn task_update_sql(
    id: Uuid,
    expect: &TaskExpectation,
    patch: &TaskPatch,
) -> Result<(String, Vec<Value>), DatabaseError> {
    let mut b = Binder::default();
    let mut sets = vec![
        "version = version + 1".to_string(),
        format!("updated_at = {}", b.bind(ts(&Utc::now()))),
    ];

    if let Some(status) = patch.status {
        sets.push(format!("status = {}", b.bind(text(status.as_str()))));
    }
    if let Some(assigned_to) = patch.assigned_to {
        sets.push(format!("assigned_to = {}", b.bind(opt_uuid(assigned_to))));
    }
    if let Some(at) = patch.assigned_at {
        sets.push(format!("assigned_at = {}", b.bind(opt_ts(at))));
    }
    if let Some(at) = patch.started_at {
        sets.push(format!("started_at = {}", b.bind(opt_ts(at))));
    }
    if let Some(at) = patch.completed_at {
        sets.push(format!("completed_at = {}", b.bind(opt_ts(at))));
    }
    if let Some(deps) = &patch.depends_on {
        sets.push(format!("depends_on = {}", b.bind(json(deps)?)));
    }
    if let Some(blockers) = &patch.blocked_by {
        sets.push(format!("blocked_by = {}", b.bind(json(blockers)?)));
    }
    if let Some(summary) = &patch.result_summary {
        sets.push(format!("result_summary = {}", b.bind(opt_text(summary.as_deref()))));
    }
    if let Some(message) = &patch.error_message {
        sets.push(format!("error_message = {}", b.bind(opt_text(message.as_deref()))));
    }
    if let Some(tokens) = patch.tokens_used {
        sets.push(format!("tokens_used = {}", b.bind(int(tokens))));
    }
    if let Some(cost) = patch.cost_usd {
        sets.push(format!("cost_usd = {}", b.bind(text(cost.to_string()))));
    }
    if let Some(ms) = patch.duration_ms {
        sets.push(format!("duration_ms = {}", b.bind(int(ms))));
    }
    if let Some(processed) = patch.unblock_processed {
        sets.push(format!(
            "unblock_processed = {}",
            b.bind(Value::Integer(i64::from(processed)))
        ));
    }

    let mut conds = vec![format!("id = {}", b.bind(text(id.to_string())))];
    if !expect.statuses.is_empty() {
        let list = b.bind_list(expect.statuses.iter().map(|s| text(s.as_str())));
        conds.push(format!("status IN ({list})"));
    }
    match expect.assigned_to {
        Some(Some(worker_id)) => {
            conds.push(format!("assigned_to = {}", b.bind(text(worker_id.to_string()))));
        }
        Some(None) => conds.push("assigned_to IS NULL".to_string()),
        None => {}
    }
    if let Some(version) = expect.version {
        conds.push(format!("version = {}", b.bind(int(version))));
    }

    let sql = format!(
        "UPDATE tasks SET {} WHERE {}",
        sets.join(", "),
        conds.join(" AND ")
    );
    Ok((sql, b.params))
}

fn worker_update_sql(id: Uuid, expect: &WorkerExpectation, patch: &WorkerPatch) -> (String, Vec<Value>) {
    let mut b = Binder::default();
    let mut sets = vec![
        "version = version + 1".to_string(),
        format!("updated_at = {}", b.bind(ts(&Utc::now()))),
    ];

    if let Some(status) = patch.status {
        sets.push(format!("status = {}", b.bind(text(status.as_str()))));
    }
    if let Some(task_id) = patch.current_task_id {
        sets.push(format!("current_task_id = {}", b.bind(opt_uuid(task_id))));
    }
    if let Some(task_id) = patch.last_completed_task_id {
        sets.push(format!("last_completed_task_id = {}", b.bind(opt_uuid(task_id))));
    }
    if let Some(n) = patch.tasks_completed {
        sets.push(format!("tasks_completed = {}", b.bind(int(n))));
    }
    if let Some(n) = patch.tasks_failed {
        sets.push(format!("tasks_failed = {}", b.bind(int(n))));
    }
    if let Some(n) = patch.total_tokens_used {
        sets.push(format!("total_tokens_used = {}", b.bind(int(n))));
    }
    if let Some(cost) = patch.total_cost_usd {
        sets.push(format!("total_cost_usd = {}", b.bind(text(cost.to_string()))));
    }

    let mut conds = vec![format!("id = {}", b.bind(text(id.to_string())))];
    if !expect.statuses.is_empty() {
        let list = b.bind_list(expect.statuses.iter().map(|s| text(s.as_str())));
        conds.push(format!("status IN ({list})"));
    }
    match expect.current_task_id {
        Some(Some(task_id)) => {
            conds.push(format!("current_task_id = {}", b.bind(text(task_id.to_string()))));
        }
        Some(None) => conds.push("current_task_id IS NULL".to_string()),
        None => {}
    }
    if let Some(cutoff) = expect.heartbeat_before {
        conds.push(format!("last_heartbeat < {}", b.bind(ts(&cutoff))));
    }
    if let Some(version) = expect.version {
        conds.push(format!("version = {}", b.bind(int(version))));
    }

    let sql = format!(
        "UPDATE workers SET {} WHERE {}",
        sets.join(", "),
        conds.join(" AND ")
    );
    (sql, b.params)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.create_tasks(std::slice::from_ref(task)).await
    }

    async fn create_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        if tasks.is_empty() {
            return Ok(());
        }

        // Chunked multi-row INSERTs inside one transaction keep the batch
        // all-or-nothing and under SQLite's bound-parameter limit.
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_tasks: begin: {e}")))?;
        for chunk in tasks.chunks(INSERT_CHUNK) {
            let mut b = Binder::default();
            let mut rows = Vec::with_capacity(chunk.len());
            for task in chunk {
                let placeholders = b.bind_list(task_values(task)?);
                rows.push(format!("({placeholders})"));
            }
            let sql = format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES {}",
                rows.join(", ")
            );

            if let Err(e) = tx.execute(&sql, Params::Positional(b.params)).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "create_tasks: rollback failed");
                }
                let msg = e.to_string();
                return Err(if msg.contains("UNIQUE") || msg.contains("constraint") {
                    DatabaseError::Constraint(format!("create_tasks: {msg}"))
                } else {
                    DatabaseError::Query(format!("create_tasks: {msg}"))
                });
            }
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_tasks: commit: {e}")))?;

        debug!(count = tasks.len(), "Tasks inserted into DB");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .fetch_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                Params::Positional(vec![text(id.to_string())]),
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError> {
        let mut b = Binder::default();
        let mut conds = Vec::new();
        if !query.statuses.is_empty() {
            let list = b.bind_list(query.statuses.iter().map(|s| text(s.as_str())));
            conds.push(format!("status IN ({list})"));
        }
        if let Some(worker_id) = query.assigned_to {
            conds.push(format!("assigned_to = {}", b.bind(text(worker_id.to_string()))));
        }

        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        if !conds.is_empty() {
            sql.push_str(&format!(" WHERE {}", conds.join(" AND ")));
        }
        sql.push_str(&format!(" {TASK_ORDER}"));
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", b.bind(int(limit as u64))));
        }

        self.fetch_tasks("query_tasks", &sql, Params::Positional(b.params))
            .await
    }

    async fn list_dependents(&self, id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        self.fetch_tasks(
            "list_dependents",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE EXISTS \
                 (SELECT 1 FROM json_each(tasks.depends_on) WHERE json_each.value = ?1) \
                 {TASK_ORDER}"
            ),
            Params::Positional(vec![text(id.to_string())]),
        )
        .await
    }

    async fn count_tasks_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks_by_status: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks_by_status: {e}")))?
        {
            let status: String = row.get(0).map_err(row_err)?;
            let count: i64 = row.get(1).map_err(row_err)?;
            counts.insert(parse_enum::<TaskStatus>(&status)?, to_u64(count));
        }
        Ok(counts)
    }

    async fn conditional_update_task(
        &self,
        id: Uuid,
        expect: &TaskExpectation,
        patch: &TaskPatch,
    ) -> Result<UpdateOutcome, DatabaseError> {
        let (sql, params) = task_update_sql(id, expect, patch)?;
        let outcome = self
            .execute_conditional("conditional_update_task", &sql, params)
            .await?;
        debug!(task_id = %id, ?outcome, status = ?patch.status, "Task conditional update");
        Ok(outcome)
    }

    async fn bulk_conditional_update_tasks(
        &self,
        updates: &[TaskUpdate],
    ) -> Result<Vec<UpdateOutcome>, DatabaseError> {
        let mut outcomes = Vec::with_capacity(updates.len());
        for update in updates {
            outcomes.push(
                self.conditional_update_task(update.id, &update.expect, &update.patch)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn create_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        let values = vec![
            text(worker.id.to_string()),
            text(worker.name.as_str()),
            text(worker.kind.as_str()),
            text(worker.status.as_str()),
            opt_uuid(worker.current_task_id),
            opt_uuid(worker.last_completed_task_id),
            json(&worker.capabilities)?,
            ts(&worker.last_heartbeat),
            int(worker.tasks_completed),
            int(worker.tasks_failed),
            int(worker.total_tokens_used),
            text(worker.total_cost_usd.to_string()),
            ts(&worker.created_at),
            ts(&worker.updated_at),
            int(worker.version),
        ];
        let mut b = Binder::default();
        let placeholders = b.bind_list(values);

        self.conn()
            .execute(
                &format!("INSERT INTO workers ({WORKER_COLUMNS}) VALUES ({placeholders})"),
                Params::Positional(b.params),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_worker: {e}")))?;

        debug!(worker_id = %worker.id, name = %worker.name, "Worker registered in DB");
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, DatabaseError> {
        let workers = self
            .fetch_workers(
                "get_worker",
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                Params::Positional(vec![text(id.to_string())]),
            )
            .await?;
        Ok(workers.into_iter().next())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        self.fetch_workers(
            "list_workers",
            &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id ASC"),
            Params::None,
        )
        .await
    }

    async fn conditional_update_worker(
        &self,
        id: Uuid,
        expect: &WorkerExpectation,
        patch: &WorkerPatch,
    ) -> Result<UpdateOutcome, DatabaseError> {
        let (sql, params) = worker_update_sql(id, expect, patch);
        let outcome = self
            .execute_conditional("conditional_update_worker", &sql, params)
            .await?;
        debug!(worker_id = %id, ?outcome, status = ?patch.status, "Worker conditional update");
        Ok(outcome)
    }

    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<UpdateOutcome, DatabaseError> {
        self.execute_conditional(
            "heartbeat",
            "UPDATE workers SET last_heartbeat = ?1 WHERE id = ?2 AND status != 'offline'",
            vec![ts(&at), text(id.to_string())],
        )
        .await
    }

    // ── Activity & file changes ─────────────────────────────────────

    async fn record_event(&self, event: &ActivityEvent) -> Result<(), DatabaseError> {
        let values = vec![
            text(event.id.to_string()),
            opt_uuid(event.worker_id),
            opt_uuid(event.task_id),
            text(event.event_type.as_str()),
            text(event.message.as_str()),
            json(&event.files_changed)?,
            int(event.tokens_used),
            text(event.cost_usd.to_string()),
            int(event.duration_ms),
            json(&event.metadata)?,
            ts(&event.timestamp),
        ];
        let mut b = Binder::default();
        let placeholders = b.bind_list(values);

        self.conn()
            .execute(
                &format!("INSERT INTO activity ({ACTIVITY_COLUMNS}) VALUES ({placeholders})"),
                Params::Positional(b.params),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_event: {e}")))?;
        Ok(())
    }

    async fn list_events(&self, limit: usize) -> Result<Vec<ActivityEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity \
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn record_file_change(&self, change: &FileChange) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO changes ({CHANGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    change.id.to_string(),
                    change.worker_id.to_string(),
                    change.task_id.to_string(),
                    change.file_path.as_str(),
                    change.change_type.as_str(),
                    i64::from(change.lines_added),
                    i64::from(change.lines_removed),
                    fmt_ts(&change.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_file_change: {e}")))?;

        debug!(task_id = %change.task_id, path = %change.file_path, "File change recorded");
        Ok(())
    }

    async fn list_file_changes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FileChange>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM changes WHERE timestamp >= ?1 \
                     ORDER BY timestamp ASC, rowid ASC"
                ),
                params![fmt_ts(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_file_changes_since: {e}")))?;

        let mut changes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_file_changes_since: {e}")))?
        {
            changes.push(row_to_change(&row)?);
        }
        Ok(changes)
    }

    // ── Conflicts ───────────────────────────────────────────────────

    async fn create_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError> {
        let values = vec![
            text(conflict.id.to_string()),
            text(conflict.conflict_type.as_str()),
            text(conflict.status.as_str()),
            json(&conflict.worker_ids)?,
            json(&conflict.task_ids)?,
            json(&conflict.file_paths)?,
            opt_text(conflict.resolution.as_deref()),
            ts(&conflict.detected_at),
            opt_ts(conflict.resolved_at),
            int(conflict.version),
        ];
        let mut b = Binder::default();
        let placeholders = b.bind_list(values);

        self.conn()
            .execute(
                &format!("INSERT INTO conflicts ({CONFLICT_COLUMNS}) VALUES ({placeholders})"),
                Params::Positional(b.params),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conflict: {e}")))?;
        Ok(())
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<Conflict>, DatabaseError> {
        let conflicts = self
            .fetch_conflicts(
                "get_conflict",
                &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
                Params::Positional(vec![text(id.to_string())]),
            )
            .await?;
        Ok(conflicts.into_iter().next())
    }

    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<Conflict>, DatabaseError> {
        let filter = if unresolved_only {
            "WHERE status != 'resolved' "
        } else {
            ""
        };
        self.fetch_conflicts(
            "list_conflicts",
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts {filter}ORDER BY detected_at ASC, rowid ASC"
            ),
            Params::None,
        )
        .await
    }

    async fn conditional_update_conflict(
        &self,
        id: Uuid,
        expect: &ConflictExpectation,
        patch: &ConflictPatch,
    ) -> Result<UpdateOutcome, DatabaseError> {
        let mut b = Binder::default();
        let mut sets = vec!["version = version + 1".to_string()];
        if let Some(status) = patch.status {
            sets.push(format!("status = {}", b.bind(text(status.as_str()))));
        }
        if let Some(note) = &patch.resolution {
            sets.push(format!("resolution = {}", b.bind(opt_text(note.as_deref()))));
        }
        if let Some(at) = patch.resolved_at {
            sets.push(format!("resolved_at = {}", b.bind(opt_ts(at))));
        }

        let mut conds = vec![format!("id = {}", b.bind(text(id.to_string())))];
        if !expect.statuses.is_empty() {
            let list = b.bind_list(expect.statuses.iter().map(|s| text(s.as_str())));
            conds.push(format!("status IN ({list})"));
        }
        if let Some(version) = expect.version {
            conds.push(format!("version = {}", b.bind(int(version))));
        }

        let sql = format!(
            "UPDATE conflicts SET {} WHERE {}",
            sets.join(", "),
            conds.join(" AND ")
        );
        self.execute_conditional("conditional_update_conflict", &sql, b.params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;

    async fn store() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn task_roundtrip_preserves_sets() {
        let db = store().await;
        let dep = Task::new("dep");
        let task = Task::new("main")
            .with_description("do the thing")
            .with_priority(5)
            .with_depends_on([dep.id])
            .with_file_scope(["src/auth.py", "src/lib"])
            .with_required_capabilities(["python"])
            .with_complexity(Complexity::Large);
        db.create_tasks(&[dep.clone(), task.clone()]).await.unwrap();

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Blocked);
        assert_eq!(loaded.depends_on, task.depends_on);
        assert_eq!(loaded.blocked_by, task.blocked_by);
        assert_eq!(loaded.file_scope, task.file_scope);
        assert_eq!(loaded.required_capabilities, task.required_capabilities);
        assert_eq!(loaded.estimated_complexity, Complexity::Large);
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.version, 0);

        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let db = store().await;
        let existing = Task::new("existing");
        db.create_task(&existing).await.unwrap();

        let fresh = Task::new("fresh");
        let duplicate = existing.clone();
        let err = db.create_tasks(&[fresh.clone(), duplicate]).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert!(db.get_task(fresh.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_batch_spans_several_statements() {
        let db = store().await;
        let tasks: Vec<Task> = (0..2000).map(|i| Task::new(format!("job {i}"))).collect();
        db.create_tasks(&tasks).await.unwrap();
        let counts = db.count_tasks_by_status().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2000));

        // A clash in a later chunk rolls back the earlier ones.
        let mut batch: Vec<Task> = (0..1200).map(|i| Task::new(format!("more {i}"))).collect();
        batch.push(tasks[0].clone());
        let err = db.create_tasks(&batch).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert!(db.get_task(batch[0].id).await.unwrap().is_none());
        let counts = db.count_tasks_by_status().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2000));
    }

    #[tokio::test]
    async fn unreadable_timestamp_is_a_decode_error() {
        let db = store().await;
        let worker = Worker::new("runner-1", "shell");
        db.create_worker(&worker).await.unwrap();
        db.conn()
            .execute(
                "UPDATE workers SET last_heartbeat = 'yesterday' WHERE id = ?1",
                params![worker.id.to_string()],
            )
            .await
            .unwrap();

        let err = db.get_worker(worker.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn out_of_range_integer_is_a_decode_error() {
        let db = store().await;
        let task = Task::new("big");
        db.create_task(&task).await.unwrap();
        db.conn()
            .execute(
                "UPDATE tasks SET priority = 9999999999 WHERE id = ?1",
                params![task.id.to_string()],
            )
            .await
            .unwrap();

        let err = db.get_task(task.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn query_orders_by_priority_then_age() {
        let db = store().await;
        let base = Utc::now();
        let mut old_low = Task::new("old low").with_priority(1);
        old_low.created_at = base - Duration::seconds(30);
        let mut new_high = Task::new("new high").with_priority(5);
        new_high.created_at = base;
        let mut old_high = Task::new("old high").with_priority(5);
        old_high.created_at = base - Duration::seconds(10);
        db.create_tasks(&[old_low.clone(), new_high.clone(), old_high.clone()])
            .await
            .unwrap();

        let titles: Vec<String> = db
            .query_tasks(&TaskQuery::with_status(TaskStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["old high", "new high", "old low"]);

        let limited = db.query_tasks(&TaskQuery::all().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn conditional_update_checks_expectation() {
        let db = store().await;
        let task = Task::new("claim me");
        db.create_task(&task).await.unwrap();
        let worker = Uuid::new_v4();
        let other = Uuid::new_v4();

        let expect = TaskExpectation::status(TaskStatus::Pending).unassigned();
        let first = db
            .conditional_update_task(
                task.id,
                &expect,
                &TaskPatch::new()
                    .status(TaskStatus::Assigned)
                    .assign(worker, Utc::now()),
            )
            .await
            .unwrap();
        let second = db
            .conditional_update_task(
                task.id,
                &expect,
                &TaskPatch::new()
                    .status(TaskStatus::Assigned)
                    .assign(other, Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(first, UpdateOutcome::Applied);
        assert_eq!(second, UpdateOutcome::Conflict);

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.assigned_to, Some(worker));
        assert_eq!(loaded.version, 1);

        let stale = db
            .conditional_update_task(
                task.id,
                &TaskExpectation::version(0),
                &TaskPatch::new().status(TaskStatus::Cancelled),
            )
            .await
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Conflict);
    }

    #[tokio::test]
    async fn dependents_are_found_through_json() {
        let db = store().await;
        let root = Task::new("root");
        let child = Task::new("child").with_depends_on([root.id]);
        let unrelated = Task::new("unrelated");
        db.create_tasks(&[root.clone(), child.clone(), unrelated])
            .await
            .unwrap();

        let dependents = db.list_dependents(root.id).await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, child.id);
    }

    #[tokio::test]
    async fn heartbeat_rejected_for_offline_worker() {
        let db = store().await;
        let worker = Worker::new("runner-1", "shell");
        db.create_worker(&worker).await.unwrap();

        let later = Utc::now() + Duration::seconds(5);
        assert!(db.heartbeat(worker.id, later).await.unwrap().is_applied());

        db.conditional_update_worker(
            worker.id,
            &WorkerExpectation::live(),
            &WorkerPatch::new().status(WorkerStatus::Offline),
        )
        .await
        .unwrap();
        assert_eq!(
            db.heartbeat(worker.id, later).await.unwrap(),
            UpdateOutcome::Conflict
        );
        assert_eq!(
            db.heartbeat(Uuid::new_v4(), later).await.unwrap(),
            UpdateOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn worker_counters_and_stale_expectation() {
        let db = store().await;
        let mut worker = Worker::new("runner-1", "shell");
        worker.last_heartbeat = Utc::now() - Duration::seconds(300);
        db.create_worker(&worker).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(120);
        let fresh_cutoff = Utc::now() - Duration::seconds(600);
        let not_stale = db
            .conditional_update_worker(
                worker.id,
                &WorkerExpectation::status(WorkerStatus::Idle).heartbeat_before(fresh_cutoff),
                &WorkerPatch::new().status(WorkerStatus::Offline),
            )
            .await
            .unwrap();
        assert_eq!(not_stale, UpdateOutcome::Conflict);

        let applied = db
            .conditional_update_worker(
                worker.id,
                &WorkerExpectation::status(WorkerStatus::Idle)
                    .heartbeat_before(cutoff)
                    .at_version(0),
                &WorkerPatch::new().counters(2, 1, 1500, dec!(0.0375)),
            )
            .await
            .unwrap();
        assert!(applied.is_applied());

        let loaded = db.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.tasks_completed, 2);
        assert_eq!(loaded.tasks_failed, 1);
        assert_eq!(loaded.total_cost_usd, dec!(0.0375));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn file_changes_filtered_by_window() {
        let db = store().await;
        let now = Utc::now();
        let (w, t) = (Uuid::new_v4(), Uuid::new_v4());
        db.record_file_change(
            &FileChange::new(w, t, "old.rs", ChangeType::Modified).at(now - Duration::hours(2)),
        )
        .await
        .unwrap();
        db.record_file_change(&FileChange::new(w, t, "new.rs", ChangeType::Created).at(now))
            .await
            .unwrap();

        let recent = db
            .list_file_changes_since(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].file_path, "new.rs");
        assert_eq!(recent[0].change_type, ChangeType::Created);
    }

    #[tokio::test]
    async fn conflicts_and_events_roundtrip() {
        let db = store().await;
        let mut conflict = Conflict::new(ConflictType::FileOverlap, Utc::now());
        conflict.file_paths = BTreeSet::from(["src/auth.py".to_string()]);
        db.create_conflict(&conflict).await.unwrap();

        let resolved = db
            .conditional_update_conflict(
                conflict.id,
                &ConflictExpectation::unresolved(),
                &ConflictPatch::new()
                    .status(ConflictStatus::Resolved)
                    .resolution(Some("merged by hand".into()))
                    .resolved_at(Utc::now()),
            )
            .await
            .unwrap();
        assert!(resolved.is_applied());
        assert!(db.list_conflicts(true).await.unwrap().is_empty());
        let all = db.list_conflicts(false).await.unwrap();
        assert_eq!(all[0].resolution.as_deref(), Some("merged by hand"));

        let event = ActivityEvent::new(EventType::ConflictDetected, "overlap")
            .with_metadata(serde_json::json!({"paths": ["src/auth.py"]}));
        db.record_event(&event).await.unwrap();
        let events = db.list_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ConflictDetected);
        assert_eq!(events[0].metadata["paths"][0], "src/auth.py");
    }

    #[tokio::test]
    async fn counts_by_status() {
        let db = store().await;
        let a = Task::new("a");
        let b = Task::new("b").with_depends_on([a.id]);
        let c = Task::new("c");
        db.create_tasks(&[a, b, c]).await.unwrap();

        let counts = db.count_tasks_by_status().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2));
        assert_eq!(counts.get(&TaskStatus::Blocked), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Completed), None);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let task = Task::new("durable");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_task(&task).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "durable");
    }
}
