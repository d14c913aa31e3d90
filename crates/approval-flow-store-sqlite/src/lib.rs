#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use approval_flow_core::{
    now_utc, ApprovalStore, DefinitionId, DefinitionPut, EntitySnapshot, Event, EventAction,
    HistoryPage, HistoryQuery, InstanceId, InstanceState, NewEvent, StoreError,
    WorkflowDefinition, WorkflowInstance,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

const APPROVAL_MIGRATION_VERSION: i64 = 1;

const SCHEMA_APPROVAL_V1: &str = r"
CREATE TABLE IF NOT EXISTS workflow_definitions (
  definition_id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  name TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  priority INTEGER NOT NULL,
  steps_json TEXT NOT NULL,
  transitions_json TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (code, version)
);

CREATE TRIGGER IF NOT EXISTS trg_workflow_definitions_immutable
BEFORE UPDATE OF definition_id, code, version, name, entity_type, priority,
  steps_json, transitions_json, content_hash, created_at
ON workflow_definitions
BEGIN
  SELECT RAISE(FAIL, 'workflow_definitions content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_workflow_definitions_no_delete
BEFORE DELETE ON workflow_definitions
BEGIN
  SELECT RAISE(FAIL, 'workflow_definitions are retired, never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_workflow_definitions_lookup
  ON workflow_definitions(entity_type, active, priority);

CREATE TABLE IF NOT EXISTS workflow_instances (
  instance_id TEXT PRIMARY KEY,
  definition_id TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  entity_snapshot_json TEXT NOT NULL,
  state TEXT NOT NULL CHECK (
    state IN ('in_progress', 'approved', 'rejected', 'cancelled', 'expired')
  ),
  current_step_id TEXT,
  resolved_approvers_json TEXT NOT NULL,
  requester TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  expires_at TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  FOREIGN KEY (definition_id) REFERENCES workflow_definitions(definition_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_workflow_instances_in_flight
  ON workflow_instances(entity_type, entity_id)
  WHERE state = 'in_progress';

CREATE INDEX IF NOT EXISTS idx_workflow_instances_deadline
  ON workflow_instances(state, expires_at);

CREATE INDEX IF NOT EXISTS idx_workflow_instances_activity
  ON workflow_instances(COALESCE(completed_at, started_at));

CREATE TRIGGER IF NOT EXISTS trg_workflow_instances_terminal
BEFORE UPDATE ON workflow_instances
WHEN OLD.state <> 'in_progress'
BEGIN
  SELECT RAISE(FAIL, 'terminal workflow instances are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_workflow_instances_pinned
BEFORE UPDATE OF instance_id, definition_id, entity_type, entity_id, requester, started_at
ON workflow_instances
BEGIN
  SELECT RAISE(FAIL, 'workflow instance identity columns are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_workflow_instances_no_delete
BEFORE DELETE ON workflow_instances
BEGIN
  SELECT RAISE(FAIL, 'workflow instances are retained for audit');
END;

CREATE TABLE IF NOT EXISTS workflow_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  instance_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (
    action IN ('start', 'approve', 'reject', 'cancel', 'expire', 'advance')
  ),
  actor TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  comment TEXT,
  resulting_state TEXT NOT NULL CHECK (
    resulting_state IN ('in_progress', 'approved', 'rejected', 'cancelled', 'expired')
  ),
  resulting_step TEXT,
  approvers_json TEXT NOT NULL DEFAULT '[]',
  snapshot_json TEXT,
  expires_at TEXT,
  instance_version INTEGER NOT NULL CHECK (instance_version >= 1),
  UNIQUE (instance_id, action, actor, occurred_at),
  FOREIGN KEY (instance_id) REFERENCES workflow_instances(instance_id)
);

CREATE TRIGGER IF NOT EXISTS trg_workflow_events_no_update
BEFORE UPDATE ON workflow_events
BEGIN
  SELECT RAISE(FAIL, 'workflow_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_workflow_events_no_delete
BEFORE DELETE ON workflow_events
BEGIN
  SELECT RAISE(FAIL, 'workflow_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_workflow_events_instance_seq
  ON workflow_events(instance_id, event_seq);
";

const DEFINITION_COLUMNS: &str = "definition_id, code, version, name, entity_type, active, \
     priority, steps_json, transitions_json, content_hash, created_at";

const INSTANCE_COLUMNS: &str = "instance_id, definition_id, entity_type, entity_id, \
     entity_snapshot_json, state, current_step_id, resolved_approvers_json, requester, \
     started_at, completed_at, expires_at, version";

const EVENT_COLUMNS: &str = "event_seq, event_id, instance_id, action, actor, occurred_at, \
     recorded_at, comment, resulting_state, resulting_step, approvers_json, snapshot_json, \
     expires_at, instance_version";

/// SQLite-backed [`ApprovalStore`]. One connection per handle; open one
/// handle per thread to get real cross-connection compare-and-swap.
pub struct SqliteApprovalStore {
    conn: Mutex<Connection>,
}

impl SqliteApprovalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens `path` and applies the schema.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_APPROVAL_V1)
            .context("failed to apply approval schema")?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![APPROVAL_MIGRATION_VERSION, format_timestamp(now_utc())?],
        )
        .context("failed to register approval schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.connection()?
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read schema_migrations")
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn put_definition_inner(&self, definition: &WorkflowDefinition) -> Result<DefinitionPut> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start definition transaction")?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE code = ?1 AND version = ?2"
                ),
                params![definition.code, i64::from(definition.version)],
                parse_definition_row,
            )
            .optional()
            .context("failed to look up definition by code and version")?;

        if let Some(existing) = existing {
            if existing.content_hash == definition.content_hash {
                return Ok(DefinitionPut::AlreadyPresent(existing));
            }
            return Err(StoreError::DefinitionConflict {
                code: definition.code.clone(),
                version: definition.version,
            }
            .into());
        }

        tx.execute(
            &format!(
                "INSERT INTO workflow_definitions({DEFINITION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                definition.id.to_string(),
                definition.code,
                i64::from(definition.version),
                definition.name,
                definition.entity_type,
                bool_to_sql(definition.active),
                i64::from(definition.priority),
                serde_json::to_string(&definition.steps).context("failed to serialize steps")?,
                serde_json::to_string(&definition.transitions)
                    .context("failed to serialize transitions")?,
                definition.content_hash,
                format_timestamp(definition.created_at)?,
            ],
        )
        .context("failed to insert workflow definition")?;
        tx.commit().context("failed to commit definition transaction")?;

        Ok(DefinitionPut::Inserted(definition.clone()))
    }

    fn query_definitions(&self, sql: &str, values: Vec<SqlValue>) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), parse_definition_row)?;
        collect_rows(rows)
    }

    fn get_definition_inner(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>> {
        self.connection()?
            .query_row(
                &format!("SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE definition_id = ?1"),
                params![id.to_string()],
                parse_definition_row,
            )
            .optional()
            .context("failed to load workflow definition")
    }

    fn set_definition_active_inner(&self, id: DefinitionId, active: bool) -> Result<WorkflowDefinition> {
        let changed = self
            .connection()?
            .execute(
                "UPDATE workflow_definitions SET active = ?1 WHERE definition_id = ?2",
                params![bool_to_sql(active), id.to_string()],
            )
            .context("failed to update definition active flag")?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("workflow definition {id}")).into());
        }
        self.get_definition_inner(id)?
            .ok_or_else(|| anyhow!("workflow definition {id} vanished after update"))
    }

    fn insert_instance_inner(
        &self,
        instance: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start instance transaction")?;

        let inserted = tx.execute(
            &format!(
                "INSERT INTO workflow_instances({INSTANCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                instance.id.to_string(),
                instance.workflow_definition_id.to_string(),
                instance.entity_type,
                instance.entity_id,
                serde_json::to_string(&instance.entity_snapshot)
                    .context("failed to serialize entity snapshot")?,
                instance.state.as_str(),
                instance.current_step_id,
                serde_json::to_string(&instance.resolved_approvers)
                    .context("failed to serialize resolved approvers")?,
                instance.requester,
                format_timestamp(instance.started_at)?,
                format_optional(instance.completed_at)?,
                format_optional(instance.expires_at)?,
                version_to_sql(instance.version)?,
            ],
        );
        if let Err(err) = inserted {
            if unique_violation(&err).is_some_and(|message| message.contains("workflow_instances.entity_type")) {
                return Err(StoreError::DuplicateInFlight {
                    entity_type: instance.entity_type.clone(),
                    entity_id: instance.entity_id.clone(),
                }
                .into());
            }
            return Err(anyhow::Error::new(err).context("failed to insert workflow instance"));
        }

        let sequenced = append_events(&tx, instance.id, events)?;
        tx.commit().context("failed to commit instance transaction")?;
        Ok(sequenced)
    }

    fn query_instances(&self, sql: &str, values: Vec<SqlValue>) -> Result<Vec<WorkflowInstance>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), parse_instance_row)?;
        collect_rows(rows)
    }

    fn get_instance_inner(&self, id: InstanceId) -> Result<Option<WorkflowInstance>> {
        self.connection()?
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE instance_id = ?1"),
                params![id.to_string()],
                parse_instance_row,
            )
            .optional()
            .context("failed to load workflow instance")
    }

    fn commit_transition_inner(
        &self,
        expected_version: u64,
        next: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transition transaction")?;

        let changed = tx
            .execute(
                "UPDATE workflow_instances SET
                    entity_snapshot_json = ?1,
                    state = ?2,
                    current_step_id = ?3,
                    resolved_approvers_json = ?4,
                    completed_at = ?5,
                    expires_at = ?6,
                    version = ?7
                 WHERE instance_id = ?8 AND version = ?9",
                params![
                    serde_json::to_string(&next.entity_snapshot)
                        .context("failed to serialize entity snapshot")?,
                    next.state.as_str(),
                    next.current_step_id,
                    serde_json::to_string(&next.resolved_approvers)
                        .context("failed to serialize resolved approvers")?,
                    format_optional(next.completed_at)?,
                    format_optional(next.expires_at)?,
                    version_to_sql(next.version)?,
                    next.id.to_string(),
                    version_to_sql(expected_version)?,
                ],
            )
            .context("failed to update workflow instance")?;

        if changed == 0 {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT version FROM workflow_instances WHERE instance_id = ?1",
                    params![next.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read current instance version")?;
            return Err(match actual {
                Some(actual) => StoreError::VersionConflict {
                    instance_id: next.id,
                    expected: expected_version,
                    actual: u64::try_from(actual).unwrap_or_default(),
                },
                None => StoreError::NotFound(format!("workflow instance {}", next.id)),
            }
            .into());
        }

        let sequenced = append_events(&tx, next.id, events)?;
        tx.commit().context("failed to commit transition transaction")?;
        Ok(sequenced)
    }

    fn list_events_inner(&self, id: InstanceId) -> Result<Vec<Event>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM workflow_events WHERE instance_id = ?1 ORDER BY event_seq ASC"
        ))?;
        let rows = stmt.query_map(params![id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    fn query_history_inner(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(entity_type) = &query.entity_type {
            values.push(SqlValue::Text(entity_type.clone()));
            clauses.push(format!("entity_type = ?{}", values.len()));
        }
        if let Some(state) = query.state {
            values.push(SqlValue::Text(state.as_str().to_string()));
            clauses.push(format!("state = ?{}", values.len()));
        }
        if let Some(from) = query.from {
            values.push(SqlValue::Text(format_timestamp(from)?));
            clauses.push(format!("COALESCE(completed_at, started_at) >= ?{}", values.len()));
        }
        if let Some(to) = query.to {
            values.push(SqlValue::Text(format_timestamp(to)?));
            clauses.push(format!("COALESCE(completed_at, started_at) < ?{}", values.len()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .connection()?
            .query_row(
                &format!("SELECT COUNT(*) FROM workflow_instances{filter}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .context("failed to count history rows")?;

        let mut page_values = values;
        page_values.push(SqlValue::Integer(i64::from(query.page_size)));
        let limit_index = page_values.len();
        page_values.push(SqlValue::Integer(
            i64::try_from(query.offset()).context("history offset out of range")?,
        ));
        let offset_index = page_values.len();

        let items = self.query_instances(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances{filter}
                 ORDER BY COALESCE(completed_at, started_at) DESC, instance_id DESC
                 LIMIT ?{limit_index} OFFSET ?{offset_index}"
            ),
            page_values,
        )?;

        Ok(HistoryPage {
            items,
            page: query.page.max(1),
            page_size: query.page_size,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

fn append_events(
    tx: &rusqlite::Transaction<'_>,
    instance_id: InstanceId,
    events: Vec<NewEvent>,
) -> Result<Vec<Event>> {
    let mut sequenced = Vec::with_capacity(events.len());
    for input in events {
        let event_id = Ulid::new();
        let inserted = tx.execute(
            "INSERT INTO workflow_events(
                event_id, instance_id, action, actor, occurred_at, recorded_at, comment,
                resulting_state, resulting_step, approvers_json, snapshot_json, expires_at,
                instance_version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event_id.to_string(),
                instance_id.to_string(),
                input.action.as_str(),
                input.actor,
                format_timestamp(input.occurred_at)?,
                format_timestamp(input.recorded_at)?,
                input.comment,
                input.resulting_state.as_str(),
                input.resulting_step,
                serde_json::to_string(&input.approvers).context("failed to serialize approvers")?,
                input
                    .snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("failed to serialize snapshot")?,
                format_optional(input.expires_at)?,
                version_to_sql(input.instance_version)?,
            ],
        );
        if let Err(err) = inserted {
            if unique_violation(&err).is_some_and(|message| message.contains("workflow_events.instance_id")) {
                return Err(StoreError::DuplicateEvent {
                    instance_id,
                    action: input.action,
                    actor: input.actor.clone(),
                }
                .into());
            }
            return Err(anyhow::Error::new(err).context("failed to append workflow event"));
        }

        let event_seq = tx.last_insert_rowid();
        sequenced.push(Event::from_new(event_seq, event_id, instance_id, input));
    }
    Ok(sequenced)
}

/// Keeps typed store errors raised inside helpers; everything else is a backend failure.
fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(typed) => typed,
        Err(other) => StoreError::Backend(format!("{other:#}")),
    }
}

impl ApprovalStore for SqliteApprovalStore {
    fn put_definition(&self, definition: &WorkflowDefinition) -> Result<DefinitionPut, StoreError> {
        self.put_definition_inner(definition).map_err(into_store_error)
    }

    fn get_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.get_definition_inner(id).map_err(into_store_error)
    }

    fn list_definitions(&self, entity_type: Option<&str>) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let (filter, values) = match entity_type {
            Some(entity_type) => (" WHERE entity_type = ?1", vec![SqlValue::Text(entity_type.to_string())]),
            None => ("", Vec::new()),
        };
        self.query_definitions(
            &format!(
                "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions{filter}
                 ORDER BY entity_type ASC, code ASC, version ASC"
            ),
            values,
        )
        .map_err(into_store_error)
    }

    fn active_definitions_for(&self, entity_type: &str) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.query_definitions(
            &format!(
                "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions
                 WHERE entity_type = ?1 AND active = 1
                 ORDER BY priority ASC, version DESC, definition_id ASC"
            ),
            vec![SqlValue::Text(entity_type.to_string())],
        )
        .map_err(into_store_error)
    }

    fn set_definition_active(
        &self,
        id: DefinitionId,
        active: bool,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.set_definition_active_inner(id, active)
            .map_err(into_store_error)
    }

    fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        self.insert_instance_inner(instance, events)
            .map_err(into_store_error)
    }

    fn get_instance(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError> {
        self.get_instance_inner(id).map_err(into_store_error)
    }

    fn find_in_flight(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let found = self
            .query_instances(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                     WHERE entity_type = ?1 AND entity_id = ?2 AND state = 'in_progress'"
                ),
                vec![
                    SqlValue::Text(entity_type.to_string()),
                    SqlValue::Text(entity_id.to_string()),
                ],
            )
            .map_err(into_store_error)?;
        Ok(found.into_iter().next())
    }

    fn commit_transition(
        &self,
        expected_version: u64,
        next: &WorkflowInstance,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        self.commit_transition_inner(expected_version, next, events)
            .map_err(into_store_error)
    }

    fn list_events(&self, id: InstanceId) -> Result<Vec<Event>, StoreError> {
        self.list_events_inner(id).map_err(into_store_error)
    }

    fn list_pending_for(&self, identity: &str) -> Result<Vec<WorkflowInstance>, StoreError> {
        self.query_instances(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 WHERE state = 'in_progress'
                   AND EXISTS (
                     SELECT 1 FROM json_each(workflow_instances.resolved_approvers_json)
                     WHERE json_each.value = ?1
                   )
                 ORDER BY started_at ASC, instance_id ASC"
            ),
            vec![SqlValue::Text(identity.to_string())],
        )
        .map_err(into_store_error)
    }

    fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        self.query_history_inner(query).map_err(into_store_error)
    }

    fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let now = format_timestamp(now).map_err(into_store_error)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_instances(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 WHERE state = 'in_progress' AND expires_at IS NOT NULL AND expires_at <= ?1
                 ORDER BY expires_at ASC, instance_id ASC
                 LIMIT ?2"
            ),
            vec![SqlValue::Text(now), SqlValue::Integer(limit)],
        )
        .map_err(into_store_error)
    }
}

/// Fixed-width UTC text so lexical order in SQL equals time order.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format timestamp")
}

pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored timestamp: {raw}"))
}

fn format_optional(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(format_timestamp).transpose()
}

fn version_to_sql(version: u64) -> Result<i64> {
    i64::try_from(version).with_context(|| format!("instance version out of range: {version}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn unique_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message))
            if failure.code == ErrorCode::ConstraintViolation
                && message.starts_with("UNIQUE constraint failed") =>
        {
            Some(message.as_str())
        }
        _ => None,
    }
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn column_timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| conversion_error(index, format!("{err:#}")))
}

fn column_optional_timestamp(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.as_deref()
        .map(|raw| parse_timestamp(raw).map_err(|err| conversion_error(index, format!("{err:#}"))))
        .transpose()
}

fn column_json<T: serde::de::DeserializeOwned>(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(index, format!("invalid JSON column: {err}")))
}

fn column_ulid(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw).map_err(|_| conversion_error(index, format!("invalid ULID: {raw}")))
}

fn column_u64(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| conversion_error(index, format!("negative counter: {raw}")))
}

fn column_state(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<InstanceState> {
    let raw: String = row.get(index)?;
    InstanceState::parse(&raw).ok_or_else(|| conversion_error(index, format!("invalid state: {raw}")))
}

fn parse_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowDefinition> {
    let version_i64: i64 = row.get(2)?;
    let priority_i64: i64 = row.get(6)?;
    Ok(WorkflowDefinition {
        id: DefinitionId(column_ulid(row, 0)?),
        code: row.get(1)?,
        version: u32::try_from(version_i64)
            .map_err(|_| conversion_error(2, format!("invalid definition version: {version_i64}")))?,
        name: row.get(3)?,
        entity_type: row.get(4)?,
        active: row.get::<_, i64>(5)? == 1,
        priority: i32::try_from(priority_i64)
            .map_err(|_| conversion_error(6, format!("invalid priority: {priority_i64}")))?,
        steps: column_json(row, 7)?,
        transitions: column_json(row, 8)?,
        content_hash: row.get(9)?,
        created_at: column_timestamp(row, 10)?,
    })
}

fn parse_instance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let resolved_approvers: BTreeSet<String> = column_json(row, 7)?;
    let entity_snapshot: EntitySnapshot = column_json(row, 4)?;
    Ok(WorkflowInstance {
        id: InstanceId(column_ulid(row, 0)?),
        workflow_definition_id: DefinitionId(column_ulid(row, 1)?),
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        entity_snapshot,
        state: column_state(row, 5)?,
        current_step_id: row.get(6)?,
        resolved_approvers,
        requester: row.get(8)?,
        started_at: column_timestamp(row, 9)?,
        completed_at: column_optional_timestamp(row, 10)?,
        expires_at: column_optional_timestamp(row, 11)?,
        version: column_u64(row, 12)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let action_raw: String = row.get(3)?;
    let action = EventAction::parse(&action_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid action: {action_raw}")))?;
    let snapshot_raw: Option<String> = row.get(11)?;
    let snapshot = snapshot_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<EntitySnapshot>(raw)
                .map_err(|err| conversion_error(11, format!("invalid snapshot_json: {err}")))
        })
        .transpose()?;

    Ok(Event {
        event_seq: row.get(0)?,
        event_id: column_ulid(row, 1)?,
        instance_id: InstanceId(column_ulid(row, 2)?),
        action,
        actor: row.get(4)?,
        occurred_at: column_timestamp(row, 5)?,
        recorded_at: column_timestamp(row, 6)?,
        comment: row.get(7)?,
        resulting_state: column_state(row, 8)?,
        resulting_step: row.get(9)?,
        approvers: column_json(row, 10)?,
        snapshot,
        expires_at: column_optional_timestamp(row, 12)?,
        instance_version: column_u64(row, 13)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
