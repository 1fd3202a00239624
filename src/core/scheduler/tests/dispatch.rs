use super::*;
use crate::core::scheduler::ExecutionStatus;
use crate::core::store::{NewTask, TriggerType, now_ms};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_task_goes_to_idle_matching_agent() {
    let f = fixture(Gate::closed());
    let dev = add_agent(&f.store, "dev-1", Role::Developer).await;
    let task = add_task(&f.store, "X", Role::Developer, Priority::High).await;

    let report = f.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(task.id.clone(), dev.id.clone())]);

    let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.assigned_agent_id.as_deref(), Some(dev.id.as_str()));
    assert!(stored.started_at.is_some());

    let record = f.scheduler.state().execution(&task.id).unwrap();
    assert!(record.step >= 1);
    assert_eq!(record.status, ExecutionStatus::Running);
    assert!(f.scheduler.state().is_busy(&dev.id));

    f.gate.release(1);
    wait_for_status(&f.store, &task.id, TaskStatus::Done).await;
    wait_until(|| !f.scheduler.state().is_busy(&dev.id)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_idle_agent_takes_one_task_per_tick() {
    let f = fixture(Gate::closed());
    let dev = add_agent(&f.store, "dev-1", Role::Developer).await;
    let low = add_task(&f.store, "later", Role::Developer, Priority::Low).await;
    let high = add_task(&f.store, "first", Role::Developer, Priority::High).await;

    let report = f.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(high.id.clone(), dev.id.clone())]);
    assert_eq!(report.skipped, vec![low.id.clone()]);
    assert_eq!(status_of(&f.store, &low.id).await, TaskStatus::Backlog);

    // Still busy on the next tick.
    let report = f.scheduler.tick().await.unwrap();
    assert!(report.dispatched.is_empty());

    f.gate.release(1);
    wait_for_status(&f.store, &high.id, TaskStatus::Done).await;
    wait_until(|| !f.scheduler.state().is_busy(&dev.id)).await;

    let report = f.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(low.id.clone(), dev.id.clone())]);
    f.gate.release(1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fifo_within_priority() {
    let f = fixture(Gate::closed());
    add_agent(&f.store, "qa", Role::Tester).await;
    let first = add_task(&f.store, "a", Role::Tester, Priority::Medium).await;
    let second = add_task(&f.store, "b", Role::Tester, Priority::Medium).await;

    let report = f.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched[0].0, first.id);
    assert_eq!(report.skipped, vec![second.id]);
    f.gate.release(1);
}

#[tokio::test]
async fn manual_future_and_unmatched_tasks_wait() {
    let f = fixture(Gate::open());
    add_agent(&f.store, "dev-1", Role::Developer).await;
    let now = now_ms();

    let manual = f
        .store
        .create_task(NewTask {
            title: Some("manual".into()),
            assigned_role: Role::Developer,
            trigger_type: TriggerType::Manual,
            ..NewTask::default()
        })
        .await
        .unwrap();
    let future = f
        .store
        .create_task(NewTask {
            title: Some("future".into()),
            assigned_role: Role::Developer,
            trigger_type: TriggerType::Scheduled,
            scheduled_at: Some(now + 60_000),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let orphan = add_task(&f.store, "pm work", Role::Pm, Priority::High).await;

    let report = f.scheduler.tick_at(now).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.skipped, vec![orphan.id]);
    assert_eq!(status_of(&f.store, &manual.id).await, TaskStatus::Backlog);
    assert_eq!(status_of(&f.store, &future.id).await, TaskStatus::Backlog);

    let report = f.scheduler.tick_at(now + 60_000).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].0, future.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_assignment_wins_over_role() {
    let f = fixture(Gate::open());
    add_agent(&f.store, "dev-1", Role::Developer).await;
    let pm = add_agent(&f.store, "pm", Role::Pm).await;
    let task = f
        .store
        .create_task(NewTask {
            title: Some("plan".into()),
            assigned_role: Role::Developer,
            assigned_agent_id: Some(pm.id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let report = f.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(task.id.clone(), pm.id.clone())]);
    wait_for_status(&f.store, &task.id, TaskStatus::Done).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_run_leaves_task_in_progress() {
    let f = fixture(Gate::failing());
    let dev = add_agent(&f.store, "dev-1", Role::Developer).await;
    let task = add_task(&f.store, "boom", Role::Developer, Priority::Medium).await;

    f.scheduler.tick().await.unwrap();
    wait_until(|| {
        f.scheduler
            .state()
            .execution(&task.id)
            .is_some_and(|r| r.status == ExecutionStatus::Failed)
    })
    .await;

    assert!(!f.scheduler.state().is_busy(&dev.id));
    assert!(!f.scheduler.state().is_dispatched(&task.id));
    assert_eq!(status_of(&f.store, &task.id).await, TaskStatus::InProgress);
    assert_eq!(f.gate.calls(), 1);

    // The failed record is dropped on the next tick; the task is not retried.
    let report = f.scheduler.tick().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert!(f.scheduler.state().execution(&task.id).is_none());
}
