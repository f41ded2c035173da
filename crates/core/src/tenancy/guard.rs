//! Per-operation tenant scoping
//!
//! [`TenantGuard`] wraps any [`DataStore`] and enforces isolation on every
//! call. The scope is explicit — callers construct a guard bound to one
//! tenant (or to the platform bypass) and pass it down; nothing is read
//! from thread-locals.
//!
//! Violations are programming or security errors. They surface as
//! [`CoreError::CrossTenantReference`] and are never retried.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::tenancy::store::{
    DataStore, DeleteOp, EntityKind, ReadMany, ReadOne, Record, Relation, WriteOp,
};

/// The ambient tenant context for a guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    /// All operations are scoped to this tenant.
    Tenant(Uuid),
    /// Platform-level bypass for provisioning and admin paths. No scoping
    /// is applied; use sparingly.
    Platform,
}

impl TenantScope {
    fn tenant_id(self) -> Option<Uuid> {
        match self {
            TenantScope::Tenant(id) => Some(id),
            TenantScope::Platform => None,
        }
    }
}

/// Decorator enforcing tenant isolation over a [`DataStore`].
pub struct TenantGuard {
    inner: Arc<dyn DataStore>,
    scope: TenantScope,
}

impl TenantGuard {
    pub fn new(inner: Arc<dyn DataStore>, scope: TenantScope) -> Self {
        Self { inner, scope }
    }

    /// Rebind the same underlying store to a different scope.
    pub fn with_scope(&self, scope: TenantScope) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            scope,
        }
    }

    pub fn scope(&self) -> TenantScope {
        self.scope
    }

    /// Point lookup. For tenant-scoped entities an unscoped primary-key
    /// lookup is rewritten into a tenant-filtered first-match, so a guessed
    /// key belonging to another tenant returns `None`, never data.
    pub async fn read_one(&self, mut op: ReadOne) -> CoreResult<Option<Record>> {
        if let (Some(tenant_id), true) = (self.scope.tenant_id(), op.entity.is_tenant_scoped()) {
            match op.tenant_filter {
                None => op.tenant_filter = Some(tenant_id),
                Some(explicit) if explicit == tenant_id => {}
                Some(_) => {
                    return Err(CoreError::CrossTenantReference {
                        entity: op.entity.table(),
                        id: op.id,
                        tenant_id,
                    })
                }
            }
        }
        self.inner.read_one(op).await
    }

    /// List lookup. A missing tenant filter is injected; an explicit
    /// matching filter is left untouched; a mismatching one is a violation.
    pub async fn read_many(&self, mut op: ReadMany) -> CoreResult<Vec<Record>> {
        self.scope_filter(op.entity, &mut op.filter.tenant_id)?;
        self.inner.read_many(op).await
    }

    /// Mutating write. Walks the payload recursively before anything is
    /// persisted: client-supplied tenant ids are overridden, every direct
    /// reference field and relation clause is ownership-checked, and nested
    /// creates are stamped with the ambient tenant.
    pub async fn write(&self, mut op: WriteOp) -> CoreResult<Record> {
        if let Some(tenant_id) = self.scope.tenant_id() {
            self.stamp_and_walk(&mut op, tenant_id).await?;
            // Updates must not reach across tenants either: if the target
            // row already exists it has to belong to the ambient tenant.
            // A nonexistent id is a create with a caller-chosen key.
            if let (Some(id), true) = (op.id, op.entity.is_tenant_scoped()) {
                let existing = self.inner.read_one(ReadOne::by_id(op.entity, id)).await?;
                if let Some(existing) = existing {
                    if existing.tenant_id != Some(tenant_id) {
                        return Err(CoreError::CrossTenantReference {
                            entity: op.entity.table(),
                            id,
                            tenant_id,
                        });
                    }
                }
            }
        }
        self.inner.write(op).await
    }

    pub async fn delete(&self, mut op: DeleteOp) -> CoreResult<u64> {
        self.scope_filter(op.entity, &mut op.filter.tenant_id)?;
        self.inner.delete(op).await
    }

    fn scope_filter(&self, entity: EntityKind, slot: &mut Option<Uuid>) -> CoreResult<()> {
        if let (Some(tenant_id), true) = (self.scope.tenant_id(), entity.is_tenant_scoped()) {
            match slot {
                None => *slot = Some(tenant_id),
                Some(explicit) if *explicit == tenant_id => {}
                Some(explicit) => {
                    return Err(CoreError::CrossTenantReference {
                        entity: entity.table(),
                        id: *explicit,
                        tenant_id,
                    })
                }
            }
        }
        Ok(())
    }

    /// Recursive payload walk: inject the ambient tenant, then verify every
    /// reference the payload makes — direct foreign-key attributes, connect
    /// clauses, and nested create sub-payloads.
    async fn stamp_and_walk(&self, op: &mut WriteOp, tenant_id: Uuid) -> CoreResult<()> {
        if op.entity.is_tenant_scoped() {
            // Defense in depth: a mismatching client-supplied tenant id is
            // silently overridden rather than trusted.
            op.tenant_id = Some(tenant_id);
        }

        for (field, referenced) in op.entity.def().reference_fields {
            if let Some(Value::String(raw)) = op.attrs.get(*field) {
                let referenced_id = Uuid::parse_str(raw).map_err(|_| {
                    CoreError::InvalidInput(format!("{field} is not a valid id: {raw}"))
                })?;
                self.assert_owned(*referenced, referenced_id, tenant_id)
                    .await?;
            }
        }

        let mut relations = std::mem::take(&mut op.relations);
        for relation in relations.values_mut() {
            match relation {
                Relation::Connect { entity, id } => {
                    self.assert_owned(*entity, *id, tenant_id).await?;
                }
                Relation::Create(child) => {
                    Box::pin(self.stamp_and_walk(child, tenant_id)).await?;
                }
            }
        }
        op.relations = relations;

        Ok(())
    }

    /// Resolve the referenced entity's owning tenant through the *inner*
    /// store (unscoped on purpose — the point is to learn the true owner)
    /// and fail loudly on a mismatch. A missing referent is treated the
    /// same way: ownership cannot be proven.
    async fn assert_owned(
        &self,
        entity: EntityKind,
        id: Uuid,
        tenant_id: Uuid,
    ) -> CoreResult<()> {
        if !entity.is_tenant_scoped() {
            return Ok(());
        }
        let owner = self
            .inner
            .read_one(ReadOne::by_id(entity, id))
            .await?
            .and_then(|r| r.tenant_id);
        match owner {
            Some(owner) if owner == tenant_id => Ok(()),
            _ => {
                tracing::error!(
                    entity = entity.table(),
                    id = %id,
                    tenant_id = %tenant_id,
                    "Cross-tenant reference blocked"
                );
                Err(CoreError::CrossTenantReference {
                    entity: entity.table(),
                    id,
                    tenant_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::store::{Filter, MemDataStore};
    use serde_json::json;

    async fn seed(store: &MemDataStore, entity: EntityKind, tenant: Option<Uuid>) -> Uuid {
        let mut op = WriteOp::create(entity);
        op.tenant_id = tenant;
        store.write(op).await.unwrap().id
    }

    fn guard(store: &Arc<MemDataStore>, tenant: Uuid) -> TenantGuard {
        TenantGuard::new(
            Arc::clone(store) as Arc<dyn DataStore>,
            TenantScope::Tenant(tenant),
        )
    }

    #[tokio::test]
    async fn point_lookup_is_rewritten_to_tenant_scope() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let foreign = seed(&store, EntityKind::Project, Some(tenant_b)).await;

        // Tenant A guesses tenant B's primary key.
        let result = guard(&store, tenant_a)
            .read_one(ReadOne::by_id(EntityKind::Project, foreign))
            .await
            .unwrap();
        assert!(result.is_none());

        // Tenant B sees its own row.
        let result = guard(&store, tenant_b)
            .read_one(ReadOne::by_id(EntityKind::Project, foreign))
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn client_supplied_tenant_id_is_overridden() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        let mut op = WriteOp::create(EntityKind::Project);
        op.tenant_id = Some(tenant_b); // spoof attempt
        let record = guard(&store, tenant_a).write(op).await.unwrap();
        assert_eq!(record.tenant_id, Some(tenant_a));
    }

    #[tokio::test]
    async fn direct_reference_to_foreign_row_is_rejected() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let foreign_project = seed(&store, EntityKind::Project, Some(tenant_b)).await;

        let op = WriteOp::create(EntityKind::Task)
            .attr("project_id", json!(foreign_project.to_string()));
        let err = guard(&store, tenant_a).write(op).await.unwrap_err();
        assert!(matches!(err, CoreError::CrossTenantReference { .. }));
    }

    #[tokio::test]
    async fn connect_clause_to_foreign_row_is_rejected() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let foreign_member = seed(&store, EntityKind::Member, Some(tenant_b)).await;

        let op = WriteOp::create(EntityKind::Task).relation(
            "assignee_id",
            Relation::Connect {
                entity: EntityKind::Member,
                id: foreign_member,
            },
        );
        let err = guard(&store, tenant_a).write(op).await.unwrap_err();
        assert!(matches!(err, CoreError::CrossTenantReference { .. }));
    }

    #[tokio::test]
    async fn nested_create_inherits_ambient_tenant_and_is_walked() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let foreign_member = seed(&store, EntityKind::Member, Some(tenant_b)).await;

        // Nested create smuggling a foreign assignee two levels down.
        let mut child = WriteOp::create(EntityKind::Task)
            .attr("assignee_id", json!(foreign_member.to_string()));
        child.tenant_id = Some(tenant_b);
        let op = WriteOp::create(EntityKind::Project)
            .relation("tasks", Relation::Create(Box::new(child)));

        let err = guard(&store, tenant_a).write(op).await.unwrap_err();
        assert!(matches!(err, CoreError::CrossTenantReference { .. }));

        // A clean nested create lands under the ambient tenant.
        let mut clean_child = WriteOp::create(EntityKind::Task);
        clean_child.tenant_id = Some(tenant_b); // overridden
        let op = WriteOp::create(EntityKind::Project)
            .relation("tasks", Relation::Create(Box::new(clean_child)));
        guard(&store, tenant_a).write(op).await.unwrap();

        let tasks = store
            .read_many(ReadMany {
                entity: EntityKind::Task,
                filter: Filter::default(),
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tenant_id, Some(tenant_a));
    }

    #[tokio::test]
    async fn update_of_foreign_row_is_rejected() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let foreign = seed(&store, EntityKind::Project, Some(tenant_b)).await;

        let op = WriteOp::update(EntityKind::Project, foreign)
            .attr("name", json!("hijacked"));
        let err = guard(&store, tenant_a).write(op).await.unwrap_err();
        assert!(matches!(err, CoreError::CrossTenantReference { .. }));
    }

    #[tokio::test]
    async fn list_and_delete_filters_are_injected() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        seed(&store, EntityKind::Project, Some(tenant_a)).await;
        seed(&store, EntityKind::Project, Some(tenant_b)).await;

        let mine = guard(&store, tenant_a)
            .read_many(ReadMany {
                entity: EntityKind::Project,
                filter: Filter::default(),
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].tenant_id, Some(tenant_a));

        // Explicit mismatching filter is a violation, not a silent override.
        let err = guard(&store, tenant_a)
            .read_many(ReadMany {
                entity: EntityKind::Project,
                filter: Filter {
                    tenant_id: Some(tenant_b),
                    ..Filter::default()
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CrossTenantReference { .. }));

        let deleted = guard(&store, tenant_a)
            .delete(DeleteOp {
                entity: EntityKind::Project,
                filter: Filter::default(),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn platform_scope_bypasses_scoping() {
        let store = Arc::new(MemDataStore::new());
        let tenant_b = Uuid::new_v4();
        let foreign = seed(&store, EntityKind::Project, Some(tenant_b)).await;

        let platform = TenantGuard::new(
            Arc::clone(&store) as Arc<dyn DataStore>,
            TenantScope::Platform,
        );
        let found = platform
            .read_one(ReadOne::by_id(EntityKind::Project, foreign))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn platform_entities_are_readable_from_any_scope() {
        let store = Arc::new(MemDataStore::new());
        let tenant_a = Uuid::new_v4();
        let template = seed(&store, EntityKind::Template, None).await;

        let found = guard(&store, tenant_a)
            .read_one(ReadOne::by_id(EntityKind::Template, template))
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
