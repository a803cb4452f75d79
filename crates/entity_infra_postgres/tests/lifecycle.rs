//! Lifecycle coordinator against a real database.
//!
//! Run with: DATABASE_URL=postgresql://... cargo test -p entity_infra_postgres -- --ignored

mod common;

use chrono::{Duration, Utc};
use common::{create_request, payload, under, Harness};
use entity_infra_core::{
    EntityError, EntityPermission, InstanceRef, InstanceScope, PermissionLevel, PermissionSource,
    PrincipalKind,
};
use entity_infra_postgres::{
    DeleteEntity, GrantRequest, PgLinkStore, PgPermissionStore, UpdateEntity,
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

fn delete_request(type_code: &str, id: Uuid, requester: Uuid, hard: bool) -> DeleteEntity {
    DeleteEntity {
        type_code: type_code.to_string(),
        instance_id: id,
        requester_id: requester,
        hard_delete: hard,
        skip_permission_check: false,
    }
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn project_and_task_scenario(pool: PgPool) {
    let h = Harness::new(pool);
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();

    let project = h
        .lifecycle
        .create(&create_request("project", u1, json!({"name": "Apollo", "code": "AP-1"})))
        .await
        .unwrap();
    let p_id = project.record.id;
    assert_eq!(project.instance.display_name, "Apollo");
    assert_eq!(project.instance.business_code.as_deref(), Some("AP-1"));
    assert!(project.owner_granted);
    assert!(!project.linked);
    assert!(h
        .resolver
        .check(u1, "project", p_id, PermissionLevel::Owner)
        .await
        .unwrap());

    h.lifecycle
        .grant(&GrantRequest::user(u2, "project", InstanceScope::Instance(p_id), PermissionLevel::Edit).granted_by(u1))
        .await
        .unwrap();

    let p_ref = InstanceRef::new("project", p_id);
    let task = h
        .lifecycle
        .create(&under(
            create_request("task", u2, json!({"name": "Launch", "project_id": p_id})),
            p_ref.clone(),
        ))
        .await
        .unwrap();
    let t_id = task.record.id;
    assert!(task.linked);

    let edges: i64 = h
        .count(
            "SELECT COUNT(*) FROM entity_infra.entity_link \
             WHERE parent_type_code = 'project' AND child_type_code = 'task' \
               AND child_instance_id = $1 AND relationship_type = 'contains'",
            t_id,
        )
        .await;
    assert_eq!(edges, 1);

    let breakdown = h.resolver.explain(u2, "task", t_id).await.unwrap();
    assert_eq!(
        breakdown.level_from(PermissionSource::ParentView),
        Some(PermissionLevel::View)
    );
    assert!(breakdown.satisfies(PermissionLevel::View));

    let deleted = h
        .lifecycle
        .delete(&delete_request("project", p_id, u1, false))
        .await
        .unwrap();
    assert!(deleted.success);
    assert!(deleted.registry_deleted);
    assert_eq!(deleted.links_deleted, 1);
    assert_eq!(deleted.permissions_deleted, 2);

    let active: bool = sqlx::query_scalar("SELECT active FROM app.project WHERE id = $1")
        .bind(p_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert!(!active);
    assert_eq!(h.infra_trace(p_id).await, (0, 0, 0));
    assert!(!h
        .resolver
        .check(u1, "project", p_id, PermissionLevel::View)
        .await
        .unwrap());
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn failure_at_any_create_step_leaves_no_trace(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();
    let project = h
        .lifecycle
        .create(&create_request("project", owner, json!({"name": "Gemini"})))
        .await
        .unwrap();
    let p_ref = InstanceRef::new("project", project.record.id);
    let before = h.infra_trace(project.record.id).await;

    for step in ["task", "entity_instance", "entity_permission", "entity_link"] {
        h.arm_failpoint(step).await;
        let err = h
            .lifecycle
            .create(&under(
                create_request("task", owner, json!({"name": format!("fails at {step}")})),
                p_ref.clone(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EntityError::Transaction(_)), "{step}: {err:?}");
        h.disarm_failpoints().await;

        let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM app.task")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(tasks, 0, "{step}");
        let task_rows: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM entity_infra.entity_instance WHERE type_code = 'task') \
                  + (SELECT COUNT(*) FROM entity_infra.entity_permission WHERE type_code = 'task') \
                  + (SELECT COUNT(*) FROM entity_infra.entity_link WHERE child_type_code = 'task')",
        )
        .fetch_one(&h.pool)
        .await
        .unwrap();
        assert_eq!(task_rows, 0, "{step}");
        assert_eq!(h.infra_trace(project.record.id).await, before, "{step}");
    }
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn delete_is_symmetric_for_soft_and_hard(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();
    let project = h
        .lifecycle
        .create(&create_request("project", owner, json!({"name": "Mercury"})))
        .await
        .unwrap();
    let p_ref = InstanceRef::new("project", project.record.id);
    let links = PgLinkStore::new(h.pool.clone());

    for hard in [false, true] {
        let task = h
            .lifecycle
            .create(&under(
                create_request("task", owner, json!({"name": "child", "code": "T"})),
                p_ref.clone(),
            ))
            .await
            .unwrap();
        let t_id = task.record.id;
        let reviewer = Uuid::new_v4();
        h.lifecycle
            .grant(&GrantRequest::user(reviewer, "task", InstanceScope::Instance(t_id), PermissionLevel::Comment))
            .await
            .unwrap();

        let t_ref = InstanceRef::new("task", t_id);
        let edges = links.touching(&t_ref).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent(), p_ref);

        let deleted = h
            .lifecycle
            .delete(&delete_request("task", t_id, owner, hard))
            .await
            .unwrap();
        assert!(links.touching(&t_ref).await.unwrap().is_empty());
        assert!(links.touching(&p_ref).await.unwrap().is_empty());
        assert_eq!(deleted.links_deleted, 1);
        assert_eq!(deleted.permissions_deleted, 2);
        assert_eq!(h.infra_trace(t_id).await, (0, 0, 0), "hard = {hard}");

        let remaining = h
            .count("SELECT COUNT(*) FROM app.task WHERE id = $1", t_id)
            .await;
        assert_eq!(remaining, if hard { 0 } else { 1 });
    }
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn delete_requires_delete_level(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();
    let editor = Uuid::new_v4();
    let project = h
        .lifecycle
        .create(&create_request("project", owner, json!({"name": "Vostok"})))
        .await
        .unwrap();
    let id = project.record.id;
    h.lifecycle
        .grant(&GrantRequest::user(editor, "project", InstanceScope::Instance(id), PermissionLevel::Edit))
        .await
        .unwrap();

    let err = h
        .lifecycle
        .delete(&delete_request("project", id, editor, true))
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::PermissionDenied(_)));
    assert_eq!(h.infra_trace(id).await, (1, 2, 0));

    let mut skipped = delete_request("project", id, editor, true);
    skipped.skip_permission_check = true;
    assert!(h.lifecycle.delete(&skipped).await.unwrap().success);
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn update_keeps_registry_in_sync(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();
    let created = h
        .lifecycle
        .create(&create_request("project", owner, json!({"name": "Old", "code": "P-1"})))
        .await
        .unwrap();
    let id = created.record.id;
    assert_eq!(created.record.version, Some(1));

    let mut update = UpdateEntity {
        type_code: "project".into(),
        instance_id: id,
        payload: payload(json!({"name": "New", "code": null})),
        name_field: "name".into(),
        code_field: Some("code".into()),
        expected_version: Some(1),
    };
    let updated = h.lifecycle.update(&update).await.unwrap();
    assert!(updated.registry_synced);
    assert_eq!(updated.record.version, Some(2));

    let (name, code): (String, Option<String>) = sqlx::query_as(
        "SELECT display_name, business_code FROM entity_infra.entity_instance WHERE instance_id = $1",
    )
    .bind(id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(name, "New");
    assert_eq!(code, None);

    update.payload = payload(json!({"budget": 1200}));
    update.expected_version = None;
    let budget_only = h.lifecycle.update(&update).await.unwrap();
    assert!(!budget_only.registry_synced);
    assert_eq!(budget_only.record.version, Some(3));

    update.expected_version = Some(1);
    let err = h.lifecycle.update(&update).await.unwrap_err();
    assert!(matches!(err, EntityError::Conflict(_)));
    assert!(err.is_retryable());

    update.expected_version = None;
    let unguarded = h.lifecycle.update(&update).await.unwrap();
    assert_eq!(unguarded.record.version, Some(4));

    update.instance_id = Uuid::new_v4();
    assert!(matches!(
        h.lifecycle.update(&update).await.unwrap_err(),
        EntityError::NotFound(_)
    ));
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn create_rejects_invalid_input_before_writing(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();

    let missing_name = create_request("project", owner, json!({"code": "X"}));
    assert!(matches!(
        h.lifecycle.create(&missing_name).await.unwrap_err(),
        EntityError::Validation(_)
    ));

    let unknown_type = create_request("spaceship", owner, json!({"name": "X"}));
    assert!(matches!(
        h.lifecycle.create(&unknown_type).await.unwrap_err(),
        EntityError::Validation(_)
    ));

    let employee = h
        .lifecycle
        .create(&create_request("employee", owner, json!({"name": "Ada"})))
        .await
        .unwrap();
    let wrong_parent = under(
        create_request("task", owner, json!({"name": "misplaced"})),
        employee.instance.instance_ref(),
    );
    assert!(matches!(
        h.lifecycle.create(&wrong_parent).await.unwrap_err(),
        EntityError::Validation(_)
    ));

    let missing_parent = under(
        create_request("task", owner, json!({"name": "orphan"})),
        InstanceRef::new("project", Uuid::new_v4()),
    );
    assert!(matches!(
        h.lifecycle.create(&missing_parent).await.unwrap_err(),
        EntityError::Validation(_)
    ));

    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM app.task")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(tasks, 0);
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn link_reparent_and_revoke(pool: PgPool) {
    let h = Harness::new(pool);
    let owner = Uuid::new_v4();
    let mut projects = Vec::new();
    for name in ["A", "B"] {
        let created = h
            .lifecycle
            .create(&create_request("project", owner, json!({"name": name})))
            .await
            .unwrap();
        projects.push(created.instance.instance_ref());
    }
    let task = h
        .lifecycle
        .create(&create_request("task", owner, json!({"name": "floating"})))
        .await
        .unwrap()
        .instance
        .instance_ref();

    let first = h.lifecycle.link(&projects[0], &task, "contains").await.unwrap();
    let again = h.lifecycle.link(&projects[0], &task, "contains").await.unwrap();
    assert_eq!(first.id, again.id);

    let moved = h
        .lifecycle
        .reparent(&task, &projects[1], "contains")
        .await
        .unwrap();
    assert_eq!(moved.parent(), projects[1]);
    let parents = entity_infra_postgres::PgLinkStore::new(h.pool.clone())
        .parents_of(&task)
        .await
        .unwrap();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].display_name.as_deref(), Some("B"));

    assert!(matches!(
        h.lifecycle
            .link(&projects[0], &InstanceRef::new("task", Uuid::new_v4()), "contains")
            .await
            .unwrap_err(),
        EntityError::Validation(_)
    ));
    assert_eq!(h.lifecycle.unlink(&projects[1], &task, None).await.unwrap(), 1);

    let reader = Uuid::new_v4();
    h.lifecycle
        .grant(&GrantRequest::user(reader, "task", InstanceScope::AllInstances, PermissionLevel::View))
        .await
        .unwrap();
    assert!(h
        .resolver
        .check(reader, "task", task.instance_id, PermissionLevel::View)
        .await
        .unwrap());
    let removed = h
        .lifecycle
        .revoke(PrincipalKind::User, reader, "task", InstanceScope::AllInstances)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!h
        .resolver
        .check(reader, "task", task.instance_id, PermissionLevel::View)
        .await
        .unwrap());
}

#[sqlx::test(migrations = "../../migrations", fixtures("business_tables"))]
#[ignore] // Requires database
async fn grants_never_lower_an_unexpired_level(pool: PgPool) {
    let h = Harness::new(pool);
    let store = PgPermissionStore::new(h.pool.clone(), h.resolver.config().all_instances_id);
    let owner = Uuid::new_v4();
    let project = h
        .lifecycle
        .create(&create_request("project", owner, json!({"name": "Salyut"})))
        .await
        .unwrap()
        .instance
        .instance_ref();
    let scope = InstanceScope::Instance(project.instance_id);
    let level_of = |grants: Vec<EntityPermission>, who: Uuid| {
        grants
            .into_iter()
            .find(|g| g.principal_id == who)
            .map(|g| g.level)
    };

    let kept = h
        .lifecycle
        .grant(&GrantRequest::user(owner, "project", scope, PermissionLevel::View))
        .await
        .unwrap();
    assert_eq!(kept.level, PermissionLevel::Owner);
    assert_eq!(kept.granted_by, Some(owner));
    assert_eq!(
        level_of(store.for_instance(&project).await.unwrap(), owner),
        Some(PermissionLevel::Owner)
    );

    let raised = h
        .lifecycle
        .grant(&GrantRequest::user(owner, "project", scope, PermissionLevel::Owner))
        .await
        .unwrap();
    assert_eq!(raised.id, kept.id);

    let temp = Uuid::new_v4();
    h.lifecycle
        .grant(
            &GrantRequest::user(temp, "project", scope, PermissionLevel::Delete)
                .expires_at(Utc::now() - Duration::hours(1)),
        )
        .await
        .unwrap();
    let replaced = h
        .lifecycle
        .grant(&GrantRequest::user(temp, "project", scope, PermissionLevel::Comment))
        .await
        .unwrap();
    assert_eq!(replaced.level, PermissionLevel::Comment);
    assert_eq!(replaced.expires_at, None);

    assert_eq!(
        h.lifecycle
            .revoke(PrincipalKind::User, owner, "project", scope)
            .await
            .unwrap(),
        1
    );
    let demoted = h
        .lifecycle
        .grant(&GrantRequest::user(owner, "project", scope, PermissionLevel::View))
        .await
        .unwrap();
    assert_eq!(demoted.level, PermissionLevel::View);
    assert!(!h
        .resolver
        .check(owner, "project", project.instance_id, PermissionLevel::Edit)
        .await
        .unwrap());
}
