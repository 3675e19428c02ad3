//! Integration tests for the task manager: creation with parentage, status
//! transitions, retry accounting, and run counter maintenance.

use uuid::Uuid;

use foreman_core::Error;
use foreman_core::runs::{self, CreateRun};
use foreman_core::tasks::{self, CreateTask, ListTasks, UpdateTask};
use foreman_db::models::{Run, TaskStatus};
use foreman_db::{Db, TenantContext};

use foreman_test_utils::create_test_db;

fn ctx(org: &str) -> TenantContext {
    TenantContext::tenant(org).expect("valid org id")
}

async fn create_run(db: &Db, ctx: &TenantContext) -> Run {
    runs::create_run(
        db,
        ctx,
        CreateRun {
            input_data: serde_json::json!({}),
            metadata: None,
        },
    )
    .await
    .expect("run creation should succeed")
}

fn task_req(run_id: Uuid) -> CreateTask {
    CreateTask {
        run_id,
        parent_task_id: None,
        task_type: "noop".to_owned(),
        input_data: serde_json::json!({}),
        metadata: None,
        max_retries: None,
    }
}

fn set_status(status: TaskStatus) -> UpdateTask {
    UpdateTask {
        status: Some(status),
        ..UpdateTask::default()
    }
}

#[tokio::test]
async fn create_increments_total_tasks() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");

    let run = create_run(&db, &ctx).await;

    for _ in 0..3 {
        tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    }

    let run = runs::get_run(&db, &ctx, run.id).await.unwrap();
    assert_eq!(run.total_tasks, 3);
    assert_eq!(run.completed_tasks, 0);
    assert_eq!(run.failed_tasks, 0);

    tdb.done().await;
}

#[tokio::test]
async fn create_validates_run_parent_and_fields() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");

    // Missing run.
    let result = tasks::create_task(&db, &ctx, task_req(Uuid::new_v4())).await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let run = create_run(&db, &ctx).await;
    let other_run = create_run(&db, &ctx).await;
    let parent = tasks::create_task(&db, &ctx, task_req(other_run.id)).await.unwrap();

    // Parent in a different run.
    let result = tasks::create_task(
        &db,
        &ctx,
        CreateTask {
            parent_task_id: Some(parent.id),
            ..task_req(run.id)
        },
    )
    .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    // Parent in the same run works and is recorded.
    let parent = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    let child = tasks::create_task(
        &db,
        &ctx,
        CreateTask {
            parent_task_id: Some(parent.id),
            ..task_req(run.id)
        },
    )
    .await
    .unwrap();
    assert_eq!(child.parent_task_id, Some(parent.id));
    assert_eq!(child.org_id, run.org_id);

    // Empty type.
    let result = tasks::create_task(
        &db,
        &ctx,
        CreateTask {
            task_type: String::new(),
            ..task_req(run.id)
        },
    )
    .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    tdb.done().await;
}

#[tokio::test]
async fn max_retries_defaults_and_clamps() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;

    let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    assert_eq!(task.max_retries, 3);

    let task = tasks::create_task(
        &db,
        &ctx,
        CreateTask {
            max_retries: Some(25),
            ..task_req(run.id)
        },
    )
    .await
    .unwrap();
    assert_eq!(task.max_retries, 10);

    let task = tasks::create_task(
        &db,
        &ctx,
        CreateTask {
            max_retries: Some(-1),
            ..task_req(run.id)
        },
    )
    .await
    .unwrap();
    assert_eq!(task.max_retries, 0);

    tdb.done().await;
}

#[tokio::test]
async fn status_transitions_stamp_timestamps_once() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;
    let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();

    let task = tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Queued))
        .await
        .unwrap();
    let queued_at = task.queued_at.expect("queued_at should be set");

    let task = tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Running))
        .await
        .unwrap();
    let started_at = task.started_at.expect("started_at should be set");
    assert!(started_at >= queued_at);
    assert_eq!(task.queued_at, Some(queued_at));

    let task = tasks::update_task(
        &db,
        &ctx,
        task.id,
        UpdateTask {
            status: Some(TaskStatus::Completed),
            output_data: Some(serde_json::json!({"x": 1})),
            ..UpdateTask::default()
        },
    )
    .await
    .unwrap();
    let completed_at = task.completed_at.expect("completed_at should be set");
    assert!(completed_at >= started_at);
    assert_eq!(task.duration_ms, Some(completed_at - started_at));
    assert_eq!(task.output_data, Some(serde_json::json!({"x": 1})));

    tdb.done().await;
}

#[tokio::test]
async fn terminal_transitions_update_run_counters_once() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;

    let t1 = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    let t2 = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    let t3 = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();

    tasks::update_task(&db, &ctx, t1.id, set_status(TaskStatus::Completed))
        .await
        .unwrap();
    tasks::update_task(&db, &ctx, t2.id, set_status(TaskStatus::Failed))
        .await
        .unwrap();
    tasks::update_task(&db, &ctx, t3.id, set_status(TaskStatus::Cancelled))
        .await
        .unwrap();

    let run = runs::get_run(&db, &ctx, run.id).await.unwrap();
    assert_eq!(run.total_tasks, 3);
    assert_eq!(run.completed_tasks, 1);
    assert_eq!(run.failed_tasks, 1);
    assert!(run.completed_tasks + run.failed_tasks <= run.total_tasks);

    // Re-asserting a terminal status never double-counts.
    tasks::update_task(&db, &ctx, t1.id, set_status(TaskStatus::Completed))
        .await
        .unwrap();
    let run = runs::get_run(&db, &ctx, run.id).await.unwrap();
    assert_eq!(run.completed_tasks, 1);

    tdb.done().await;
}

#[tokio::test]
async fn retrying_increments_retry_count() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;
    let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
    assert_eq!(task.retry_count, 0);

    tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Running))
        .await
        .unwrap();
    let task = tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Retrying))
        .await
        .unwrap();
    assert_eq!(task.retry_count, 1);

    tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Running))
        .await
        .unwrap();
    let task = tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Retrying))
        .await
        .unwrap();
    assert_eq!(task.retry_count, 2);

    // Exceeding max_retries is accepted; the limit is advisory for workers.
    let task = tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Retrying))
        .await
        .unwrap();
    assert_eq!(task.retry_count, 3);

    tdb.done().await;
}

#[tokio::test]
async fn terminal_task_rejects_new_status() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;
    let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();

    tasks::update_task(&db, &ctx, task.id, set_status(TaskStatus::Failed))
        .await
        .unwrap();

    for next in [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Retrying,
    ] {
        let result = tasks::update_task(&db, &ctx, task.id, set_status(next)).await;
        assert!(
            matches!(result, Err(Error::InvalidTransition(_))),
            "transition failed -> {next} should be rejected"
        );
    }

    tdb.done().await;
}

#[tokio::test]
async fn queue_job_id_is_recorded() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;
    let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();

    let task = tasks::update_task(
        &db,
        &ctx,
        task.id,
        UpdateTask {
            status: Some(TaskStatus::Running),
            queue_job_id: Some("job-123".to_owned()),
            ..UpdateTask::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(task.queue_job_id.as_deref(), Some("job-123"));

    tdb.done().await;
}

#[tokio::test]
async fn list_filters_by_run_and_status() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");

    let run_a = create_run(&db, &ctx).await;
    let run_b = create_run(&db, &ctx).await;
    let t1 = tasks::create_task(&db, &ctx, task_req(run_a.id)).await.unwrap();
    tasks::create_task(&db, &ctx, task_req(run_a.id)).await.unwrap();
    tasks::create_task(&db, &ctx, task_req(run_b.id)).await.unwrap();

    tasks::update_task(&db, &ctx, t1.id, set_status(TaskStatus::Completed))
        .await
        .unwrap();

    let page = tasks::list_tasks(
        &db,
        &ctx,
        ListTasks {
            run_id: Some(run_a.id),
            ..ListTasks::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.total, 2);

    let page = tasks::list_tasks(
        &db,
        &ctx,
        ListTasks {
            run_id: Some(run_a.id),
            status: Some(TaskStatus::Completed),
            ..ListTasks::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, t1.id);

    tdb.done().await;
}

#[tokio::test]
async fn concurrent_terminal_transitions_count_each_task_once() {
    let tdb = create_test_db().await;
    let db = tdb.db.clone();
    let ctx = ctx("org-a");
    let run = create_run(&db, &ctx).await;

    let mut ids = Vec::new();
    for _ in 0..8 {
        let task = tasks::create_task(&db, &ctx, task_req(run.id)).await.unwrap();
        ids.push(task.id);
    }

    // Complete all tasks concurrently; the task-then-run lock order keeps
    // this deadlock-free and every increment applied exactly once.
    let mut handles = Vec::new();
    for id in ids {
        let db = db.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            tasks::update_task(&db, &ctx, id, set_status(TaskStatus::Completed)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("update should succeed");
    }

    let run = runs::get_run(&db, &ctx, run.id).await.unwrap();
    assert_eq!(run.completed_tasks, 8);
    assert_eq!(run.total_tasks, 8);

    tdb.done().await;
}
