//! The narrow data-access port
//!
//! Tenant-scoped application data moves through four verbs: `read_one`,
//! `read_many`, `write`, `delete`. Keeping the surface this small is what
//! makes the guard's recursive payload walk bounded and testable — there is
//! no open-ended ORM call surface to intercept.
//!
//! Write payloads carry scalar attributes plus explicit relation clauses
//! (`Relation::Create` for nested creates, `Relation::Connect` to attach an
//! existing row), mirroring the shapes a relational client sends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::CoreResult;

/// Entity kinds known to the scoped datastore. Each maps to one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Task,
    Member,
    /// Platform-owned templates are shared across tenants and bypass
    /// tenant scoping entirely.
    Template,
}

/// Static definition of an entity: its table, whether rows are owned by a
/// tenant, and which attribute fields are foreign keys to other entities.
pub struct EntityDef {
    pub kind: EntityKind,
    pub table: &'static str,
    pub tenant_scoped: bool,
    /// (attribute field, referenced entity). The field holds a UUID string.
    pub reference_fields: &'static [(&'static str, EntityKind)],
}

const ENTITY_DEFS: &[EntityDef] = &[
    EntityDef {
        kind: EntityKind::Project,
        table: "projects",
        tenant_scoped: true,
        reference_fields: &[],
    },
    EntityDef {
        kind: EntityKind::Task,
        table: "tasks",
        tenant_scoped: true,
        reference_fields: &[
            ("project_id", EntityKind::Project),
            ("assignee_id", EntityKind::Member),
        ],
    },
    EntityDef {
        kind: EntityKind::Member,
        table: "members",
        tenant_scoped: true,
        reference_fields: &[],
    },
    EntityDef {
        kind: EntityKind::Template,
        table: "templates",
        tenant_scoped: false,
        reference_fields: &[],
    },
];

impl EntityKind {
    pub fn def(self) -> &'static EntityDef {
        match ENTITY_DEFS.iter().find(|d| d.kind == self) {
            Some(def) => def,
            None => unreachable!("ENTITY_DEFS covers every variant"),
        }
    }

    pub fn table(self) -> &'static str {
        self.def().table
    }

    pub fn is_tenant_scoped(self) -> bool {
        self.def().tenant_scoped
    }
}

/// A stored row: primary key, owning tenant (None for platform entities),
/// and the JSON attribute map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub entity: EntityKind,
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub attrs: Map<String, Value>,
}

/// Equality filter over tenant and attributes.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub tenant_id: Option<Uuid>,
    pub attrs_eq: Map<String, Value>,
    pub limit: Option<i64>,
}

/// Point lookup keyed by primary key. `tenant_filter` is what the guard
/// injects; an unscoped lookup has it unset.
#[derive(Debug, Clone)]
pub struct ReadOne {
    pub entity: EntityKind,
    pub id: Uuid,
    pub tenant_filter: Option<Uuid>,
}

impl ReadOne {
    pub fn by_id(entity: EntityKind, id: Uuid) -> Self {
        Self {
            entity,
            id,
            tenant_filter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadMany {
    pub entity: EntityKind,
    pub filter: Filter,
}

/// Relation clause attached to a write payload under a field name.
#[derive(Debug, Clone)]
pub enum Relation {
    /// Create the child row as part of this write. The child's
    /// back-reference to the parent is filled in by the store.
    Create(Box<WriteOp>),
    /// Attach an existing row by id.
    Connect { entity: EntityKind, id: Uuid },
}

/// Create-or-update payload. `id` unset means create with a fresh key.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub entity: EntityKind,
    pub id: Option<Uuid>,
    /// Owning tenant. Client-supplied values are overridden by the guard.
    pub tenant_id: Option<Uuid>,
    pub attrs: Map<String, Value>,
    pub relations: BTreeMap<String, Relation>,
}

impl WriteOp {
    pub fn create(entity: EntityKind) -> Self {
        Self {
            entity,
            id: None,
            tenant_id: None,
            attrs: Map::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn update(entity: EntityKind, id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::create(entity)
        }
    }

    pub fn attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn relation(mut self, field: &str, relation: Relation) -> Self {
        self.relations.insert(field.to_string(), relation);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub entity: EntityKind,
    pub filter: Filter,
}

/// The four-verb port every data-access call site goes through.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn read_one(&self, op: ReadOne) -> CoreResult<Option<Record>>;
    async fn read_many(&self, op: ReadMany) -> CoreResult<Vec<Record>>;
    async fn write(&self, op: WriteOp) -> CoreResult<Record>;
    async fn delete(&self, op: DeleteOp) -> CoreResult<u64>;
}

/// Attribute field on a child row that points back at its parent, used when
/// materializing nested `Relation::Create` clauses.
fn back_reference_field(parent: EntityKind) -> &'static str {
    match parent {
        EntityKind::Project => "project_id",
        EntityKind::Task => "task_id",
        EntityKind::Member => "member_id",
        EntityKind::Template => "template_id",
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// Postgres-backed store. Each entity table has the same shape:
/// `(id uuid primary key, tenant_id uuid, attrs jsonb, created_at, updated_at)`.
#[derive(Clone)]
pub struct PgDataStore {
    pool: PgPool,
}

impl PgDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(entity: EntityKind, row: &sqlx::postgres::PgRow) -> CoreResult<Record> {
        let id: Uuid = row.try_get("id")?;
        let tenant_id: Option<Uuid> = row.try_get("tenant_id")?;
        let attrs: Value = row.try_get("attrs")?;
        let attrs = match attrs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Record {
            entity,
            id,
            tenant_id,
            attrs,
        })
    }

    async fn write_flat(&self, op: &WriteOp) -> CoreResult<Record> {
        let id = op.id.unwrap_or_else(Uuid::new_v4);
        let attrs = Value::Object(op.attrs.clone());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, tenant_id, attrs, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                attrs = {table}.attrs || EXCLUDED.attrs,
                updated_at = NOW()
            RETURNING id, tenant_id, attrs
            "#,
            table = op.entity.table()
        ))
        .bind(id)
        .bind(op.tenant_id)
        .bind(attrs)
        .fetch_one(&self.pool)
        .await?;

        Self::record_from_row(op.entity, &row)
    }
}

#[async_trait]
impl DataStore for PgDataStore {
    async fn read_one(&self, op: ReadOne) -> CoreResult<Option<Record>> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT id, tenant_id, attrs FROM {} WHERE id = ",
            op.entity.table()
        ));
        qb.push_bind(op.id);
        if let Some(tenant_id) = op.tenant_filter {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|r| Self::record_from_row(op.entity, &r)).transpose()
    }

    async fn read_many(&self, op: ReadMany) -> CoreResult<Vec<Record>> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT id, tenant_id, attrs FROM {} WHERE TRUE",
            op.entity.table()
        ));
        if let Some(tenant_id) = op.filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if !op.filter.attrs_eq.is_empty() {
            qb.push(" AND attrs @> ")
                .push_bind(Value::Object(op.filter.attrs_eq.clone()));
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = op.filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::record_from_row(op.entity, r))
            .collect()
    }

    async fn write(&self, op: WriteOp) -> CoreResult<Record> {
        // Connect clauses become foreign-key attributes on the parent;
        // Create clauses become child inserts carrying the parent's key.
        let mut parent = op.clone();
        for (field, relation) in &op.relations {
            if let Relation::Connect { id, .. } = relation {
                parent
                    .attrs
                    .insert(field.clone(), Value::String(id.to_string()));
            }
        }
        parent.relations.clear();
        let parent_record = self.write_flat(&parent).await?;

        for relation in op.relations.values() {
            if let Relation::Create(child) = relation {
                let mut child = (**child).clone();
                child.attrs.insert(
                    back_reference_field(op.entity).to_string(),
                    Value::String(parent_record.id.to_string()),
                );
                // Recurse: grandchildren are legal, the guard has already
                // walked and stamped the whole payload.
                Box::pin(self.write(child)).await?;
            }
        }

        Ok(parent_record)
    }

    async fn delete(&self, op: DeleteOp) -> CoreResult<u64> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE TRUE", op.entity.table()));
        if let Some(tenant_id) = op.filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if !op.filter.attrs_eq.is_empty() {
            qb.push(" AND attrs @> ")
                .push_bind(Value::Object(op.filter.attrs_eq.clone()));
        }
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory store with the same semantics as [`PgDataStore`]. Used by the
/// isolation test suites and available for embedded/demo deployments.
#[derive(Default)]
pub struct MemDataStore {
    rows: tokio::sync::Mutex<BTreeMap<(&'static str, Uuid), Record>>,
}

impl MemDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(record: &Record, filter: &Filter) -> bool {
        if let Some(tenant_id) = filter.tenant_id {
            if record.tenant_id != Some(tenant_id) {
                return false;
            }
        }
        filter
            .attrs_eq
            .iter()
            .all(|(k, v)| record.attrs.get(k) == Some(v))
    }
}

#[async_trait]
impl DataStore for MemDataStore {
    async fn read_one(&self, op: ReadOne) -> CoreResult<Option<Record>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(op.entity.table(), op.id))
            .filter(|r| match op.tenant_filter {
                Some(tenant_id) => r.tenant_id == Some(tenant_id),
                None => true,
            })
            .cloned())
    }

    async fn read_many(&self, op: ReadMany) -> CoreResult<Vec<Record>> {
        let rows = self.rows.lock().await;
        let mut out: Vec<Record> = rows
            .values()
            .filter(|r| r.entity == op.entity && Self::matches(r, &op.filter))
            .cloned()
            .collect();
        if let Some(limit) = op.filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn write(&self, op: WriteOp) -> CoreResult<Record> {
        let id = op.id.unwrap_or_else(Uuid::new_v4);

        let mut attrs = {
            let rows = self.rows.lock().await;
            rows.get(&(op.entity.table(), id))
                .map(|existing| existing.attrs.clone())
                .unwrap_or_default()
        };
        for (k, v) in &op.attrs {
            attrs.insert(k.clone(), v.clone());
        }
        for (field, relation) in &op.relations {
            if let Relation::Connect { id: target, .. } = relation {
                attrs.insert(field.clone(), Value::String(target.to_string()));
            }
        }

        let record = Record {
            entity: op.entity,
            id,
            tenant_id: op.tenant_id,
            attrs,
        };
        self.rows
            .lock()
            .await
            .insert((op.entity.table(), id), record.clone());

        for relation in op.relations.values() {
            if let Relation::Create(child) = relation {
                let mut child = (**child).clone();
                child.attrs.insert(
                    back_reference_field(op.entity).to_string(),
                    Value::String(id.to_string()),
                );
                Box::pin(self.write(child)).await?;
            }
        }

        Ok(record)
    }

    async fn delete(&self, op: DeleteOp) -> CoreResult<u64> {
        let mut rows = self.rows.lock().await;
        let victims: Vec<(&'static str, Uuid)> = rows
            .iter()
            .filter(|(_, r)| r.entity == op.entity && Self::matches(r, &op.filter))
            .map(|(k, _)| *k)
            .collect();
        let count = victims.len() as u64;
        for key in victims {
            rows.remove(&key);
        }
        Ok(count)
    }
}

impl std::fmt::Debug for MemDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDataStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The Pg store's SQL names columns by hand; keep the entity tables in
    /// the embedded migration in lockstep with it.
    #[test]
    fn entity_tables_declare_the_columns_the_store_writes() {
        let schema = include_str!("../../migrations/20250301000000_init.sql");
        for def in ENTITY_DEFS {
            let start = schema
                .find(&format!("CREATE TABLE {} (", def.table))
                .unwrap_or_else(|| panic!("no DDL for table {}", def.table));
            let body = &schema[start..];
            let body = &body[..body.find(");").unwrap_or(body.len())];
            for column in ["id", "tenant_id", "attrs", "created_at", "updated_at"] {
                assert!(
                    body.contains(column),
                    "table {} is missing column {column}",
                    def.table
                );
            }
        }
    }

    #[tokio::test]
    async fn mem_store_round_trips_attrs_and_merges_updates() {
        let store = MemDataStore::new();
        let tenant = Uuid::new_v4();

        let mut op = WriteOp::create(EntityKind::Project)
            .attr("name", Value::String("alpha".to_string()));
        op.tenant_id = Some(tenant);
        let created = store.write(op).await.unwrap();

        let mut update = WriteOp::update(EntityKind::Project, created.id)
            .attr("color", Value::String("green".to_string()));
        update.tenant_id = Some(tenant);
        store.write(update).await.unwrap();

        let fetched = store
            .read_one(ReadOne::by_id(EntityKind::Project, created.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.attrs.get("name"), Some(&Value::String("alpha".into())));
        assert_eq!(fetched.attrs.get("color"), Some(&Value::String("green".into())));
    }

    #[tokio::test]
    async fn nested_create_carries_back_reference() {
        let store = MemDataStore::new();
        let tenant = Uuid::new_v4();

        let mut child = WriteOp::create(EntityKind::Task)
            .attr("title", Value::String("first".to_string()));
        child.tenant_id = Some(tenant);

        let mut parent = WriteOp::create(EntityKind::Project)
            .relation("tasks", Relation::Create(Box::new(child)));
        parent.tenant_id = Some(tenant);
        let project = store.write(parent).await.unwrap();

        let tasks = store
            .read_many(ReadMany {
                entity: EntityKind::Task,
                filter: Filter::default(),
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].attrs.get("project_id"),
            Some(&Value::String(project.id.to_string()))
        );
    }

    #[tokio::test]
    async fn delete_honors_filters() {
        let store = MemDataStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for tenant in [a, b] {
            let mut op = WriteOp::create(EntityKind::Member);
            op.tenant_id = Some(tenant);
            store.write(op).await.unwrap();
        }

        let deleted = store
            .delete(DeleteOp {
                entity: EntityKind::Member,
                filter: Filter {
                    tenant_id: Some(a),
                    ..Filter::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
