//! End-to-end scenarios driving several subsystems together. Periodic
//! loops are replaced by explicit cycle calls so every step is
//! deterministic.

use crate::api::{JobState, StoredJobConfig, StoredResourcePool, StoredTask, TaskStatusUpdate};
use crate::common::resources::{ResourceKind, ResourceVector};
use crate::config::{PreemptionConfig, RmConfig};
use crate::entitlement::EntitlementCalculator;
use crate::manager::ResourceManager;
use crate::recovery;
use crate::respool::ROOT_POOL_ID;
use crate::task::rmtask::REASON_CONTAINER_LAUNCH_FAILED;
use crate::task::scheduler::REASON_PLACEMENT_TIMEOUT;
use crate::task::{TaskState, TaskType};
use crate::tests::utils::{
    cpu_config, enqueue_test_gang, offer, pool_config, test_rig, test_rig_custom, StubHostManager,
    StubStore, TestTask,
};
use crate::{Error, JobId, TaskId};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn cpu(v: f64) -> ResourceVector {
    ResourceVector::new(v, 0.0, 0.0, 0.0)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scenario: hierarchical fair share between two sibling pools. Surplus
/// follows demand while reservations stay untouched.
#[tokio::test]
async fn hierarchical_fair_share() {
    let rig = test_rig_custom(
        RmConfig::default(),
        vec![
            ("A", ROOT_POOL_ID, cpu_config(100.0, 300.0, 1.0)),
            ("B", ROOT_POOL_ID, cpu_config(100.0, 300.0, 1.0)),
        ],
    );
    rig.host_manager.set_capacity(cpu(400.0));
    let calculator = EntitlementCalculator::new(
        rig.tree.clone(),
        rig.host_manager.clone(),
        Duration::from_secs(15),
    );

    // Only A has demand.
    enqueue_test_gang(&rig, "A", &[TestTask::cpu(0, 300.0)]);
    calculator.calculate().await;

    let pool_a = rig.tree.get("A").unwrap();
    let pool_b = rig.tree.get("B").unwrap();
    assert_eq!(pool_a.entitlement().get(ResourceKind::Cpu), 300.0);
    assert_eq!(pool_b.entitlement().get(ResourceKind::Cpu), 100.0);

    // B starts demanding 200: the next cycle splits the surplus.
    enqueue_test_gang(&rig, "B", &[TestTask::cpu(1, 200.0)]);
    calculator.calculate().await;
    assert_eq!(pool_a.entitlement().get(ResourceKind::Cpu), 200.0);
    assert_eq!(pool_b.entitlement().get(ResourceKind::Cpu), 200.0);
    let total = pool_a.entitlement().get(ResourceKind::Cpu)
        + pool_b.entitlement().get(ResourceKind::Cpu);
    assert!(total <= 400.0);

    // Capacity outage: the last known capacity keeps entitlements stable.
    rig.host_manager.fail_capacity(true);
    calculator.calculate().await;
    assert_eq!(pool_a.entitlement().get(ResourceKind::Cpu), 200.0);
}

/// Scenario: a high-priority gang displaces a running low-priority task
/// from a full pool, then takes its place end to end.
#[tokio::test]
async fn priority_preemption_end_to_end() {
    let rig = test_rig();
    let engine = rig.engine();
    let pool = rig.tree.get("respool11").unwrap();
    pool.set_entitlement(cpu(100.0));

    // T_low runs and fills the pool.
    let low = enqueue_test_gang(&rig, "respool11", &[TestTask::cpu(0, 100.0).priority(1)]);
    rig.scheduler.schedule_cycle(Instant::now());
    rig.host_manager.add_offer(offer("host-1", 100.0));
    engine.process_once(TaskType::Batch).await;
    let t_low = low.tasks[0];
    assert_eq!(rig.tracker.get(t_low).unwrap().state(), TaskState::Placed);
    for state in [TaskState::Launching, TaskState::Launched, TaskState::Running] {
        rig.tracker.transition(t_low, state, None).unwrap();
    }

    // T_high arrives; the pool has no headroom left.
    let high = enqueue_test_gang(&rig, "respool11", &[TestTask::cpu(1, 100.0).priority(9)]);
    let preemptor = rig.preemptor(PreemptionConfig::default());
    preemptor.preemption_cycle().await;

    assert_eq!(rig.tracker.get(t_low).unwrap().state(), TaskState::Killing);
    assert_eq!(rig.host_manager.killed.lock().as_slice(), &[t_low]);
    assert_eq!(rig.preemption_queue.try_pop(), Some(t_low));

    // Fabric acks the kill; the allocation frees up.
    rig.tracker
        .transition(t_low, TaskState::Killed, None)
        .unwrap();
    assert!(pool.allocation().total.is_zero());

    // T_high sails through admission and placement.
    rig.scheduler.schedule_cycle(Instant::now());
    let t_high = high.tasks[0];
    assert_eq!(rig.tracker.get(t_high).unwrap().state(), TaskState::Ready);
    rig.host_manager.add_offer(offer("host-1", 100.0));
    engine.process_once(TaskType::Batch).await;
    assert_eq!(rig.tracker.get(t_high).unwrap().state(), TaskState::Placed);
    assert_eq!(
        rig.tracker.get(t_high).unwrap().runtime().host.as_deref(),
        Some("host-1")
    );
}

/// Scenario: a gang of three is admitted all-or-nothing.
#[test]
fn gang_atomicity_under_entitlement_changes() {
    let rig = test_rig();
    let pool = rig.tree.get("respool11").unwrap();
    pool.set_entitlement(cpu(100.0));

    let gang = enqueue_test_gang(
        &rig,
        "respool11",
        &[
            TestTask::cpu(0, 40.0),
            TestTask::cpu(1, 40.0),
            TestTask::cpu(2, 40.0),
        ],
    );
    rig.scheduler.schedule_cycle(Instant::now());
    for id in &gang.tasks {
        assert_eq!(rig.tracker.get(*id).unwrap().state(), TaskState::Pending);
    }
    assert!(pool.allocation().total.is_zero());

    // Raising the entitlement to fit the whole gang admits all three
    // together.
    pool.set_entitlement(cpu(120.0));
    rig.scheduler.schedule_cycle(Instant::now());
    for id in &gang.tasks {
        assert_eq!(rig.tracker.get(*id).unwrap().state(), TaskState::Ready);
    }
    assert_eq!(pool.allocation().total, cpu(120.0));
}

/// Scenario: more demand than offers. The round places what fits and
/// returns the rest to the pending queues with a placement-timeout reason.
#[tokio::test]
async fn placement_deadline_returns_leftovers() {
    let mut config = RmConfig::default();
    config.placement.task_dequeue_limit = 25;
    config.placement.task_dequeue_timeout = Duration::from_millis(50);
    config.placement.max_rounds.set(TaskType::Batch, 3);
    config
        .placement
        .max_placement_duration
        .set(TaskType::Batch, Duration::from_millis(500));
    let rig = crate::tests::utils::test_rig_with_config(config);
    let engine = rig.engine();
    let pool = rig.tree.get("respool11").unwrap();
    pool.set_entitlement(cpu(125.0));

    let gangs: Vec<_> = (0u32..25)
        .map(|i| enqueue_test_gang(&rig, "respool11", &[TestTask::cpu(i, 5.0)]))
        .collect();
    rig.scheduler.schedule_cycle(Instant::now());
    assert_eq!(rig.queues.queue(TaskType::Batch).len(), 25);

    for host in 0..10 {
        rig.host_manager.add_offer(offer(&format!("host-{host}"), 5.0));
    }
    let published = engine.process_once(TaskType::Batch).await;
    assert_eq!(published, 10);
    assert_eq!(rig.placements.len(), 10);

    let mut placed = 0;
    let mut requeued = 0;
    for gang in &gangs {
        let task = rig.tracker.get(gang.tasks[0]).unwrap();
        let runtime = task.runtime();
        match runtime.state {
            TaskState::Placed => placed += 1,
            TaskState::Pending => {
                assert_eq!(runtime.reason.as_deref(), Some(REASON_PLACEMENT_TIMEOUT));
                requeued += 1;
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
    assert_eq!(placed, 10);
    assert_eq!(requeued, 15);
    // The leftovers are queued again and admissible next cycle.
    assert!(pool.has_queued_work());
}

fn recovery_store() -> Arc<StubStore> {
    let store = StubStore::new();
    store.pools.lock().extend(vec![
        StoredResourcePool {
            id: "respool1".to_string(),
            config: pool_config("respool1", ROOT_POOL_ID, cpu_config(100.0, 1000.0, 1.0)),
        },
        StoredResourcePool {
            id: "respool11".to_string(),
            config: pool_config("respool11", "respool1", cpu_config(100.0, 1000.0, 1.0)),
        },
    ]);
    let job = JobId::new(1);
    store.jobs.lock().push((
        StoredJobConfig {
            id: job,
            respool: "respool11".to_string(),
            instance_count: 2,
            min_instances: 1,
            priority: 1,
            preemptible: true,
            controller: false,
            revocable: false,
            task_type: TaskType::Batch,
            max_failures: 0,
        },
        JobState::Running,
    ));
    store.tasks.lock().insert(
        job,
        vec![
            StoredTask {
                id: TaskId::new(job, 0.into()),
                state: TaskState::Running,
                demand: cpu(1.0),
                num_ports: 0,
                host: Some("host-1".to_string()),
            },
            StoredTask {
                id: TaskId::new(job, 1.into()),
                state: TaskState::Pending,
                demand: cpu(1.0),
                num_ports: 0,
                host: None,
            },
        ],
    );
    store
}

/// Scenario: leadership gain rebuilds tree and tracker from the store,
/// and a second recovery run changes nothing.
#[tokio::test]
async fn recovery_rebuilds_and_is_idempotent() -> anyhow::Result<()> {
    init_logging();
    let store = recovery_store();
    let host_manager = StubHostManager::new();
    host_manager.set_capacity(cpu(1000.0));
    let mut config = RmConfig::default();
    // Long periods: the loops must not interfere with manual assertions.
    config.task_scheduling_period = Duration::from_secs(3600);
    config.entitlement_calculation_period = Duration::from_secs(3600);
    config.preemption.enabled = false;
    let manager = ResourceManager::new(config, store.clone(), host_manager.clone());

    let stats = manager.start().await?;
    assert_eq!(stats.jobs_scanned, 1);
    assert_eq!(stats.tasks_running, 1);
    assert_eq!(stats.tasks_requeued, 1);

    let tree = manager.tree();
    let tracker = manager.tracker();
    assert!(tree.contains("respool1"));
    assert!(tree.contains("respool11"));
    let pool = tree.get("respool11").unwrap();
    assert_eq!(pool.allocation().total, cpu(1.0));
    assert_eq!(tracker.len(), 2);

    let job = JobId::new(1);
    let running = tracker.get(TaskId::new(job, 0.into())).unwrap();
    assert_eq!(running.state(), TaskState::Running);
    assert_eq!(running.runtime().host.as_deref(), Some("host-1"));
    let pending = tracker.get(TaskId::new(job, 1.into())).unwrap();
    assert_eq!(pending.state(), TaskState::Pending);

    // Second run over the same store state: identical outcome.
    let handler = manager.handler();
    let stats2 = recovery::recover(store.as_ref(), &tree, &tracker, &handler).await?;
    assert_eq!(stats2.tasks_requeued, 0);
    assert_eq!(stats2.tasks_running, 0);
    assert_eq!(tracker.len(), 2);
    assert_eq!(pool.allocation().total, cpu(1.0));

    // The recovered pending task is dequeueable once entitlement allows.
    pool.set_entitlement(cpu(100.0));
    let admitted = pool.dequeue_gangs(10, 0.0);
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].tasks, vec![TaskId::new(job, 1.into())]);

    manager.stop().await;
    assert!(!manager.is_running());
    // The shutdown flush wrote the recovered pending task's state back.
    assert!(store
        .updates
        .lock()
        .iter()
        .any(|(id, state, _)| *id == TaskId::new(job, 1.into()) && *state == TaskState::Pending));
    Ok(())
}

/// Scenario: store unavailability at leadership gain refuses leadership.
#[tokio::test]
async fn recovery_store_failure_refuses_leadership() {
    let store = recovery_store();
    store.fail(true);
    let host_manager = StubHostManager::new();
    let manager = ResourceManager::new(RmConfig::default(), store, host_manager);

    assert!(manager.start().await.is_err());
    assert!(!manager.is_running());
    let err = manager
        .handler()
        .enqueue_gangs("respool11", vec![vec![TestTask::cpu(0, 1.0).spec("respool11")]])
        .unwrap_err();
    assert!(matches!(err, Error::NotLeader));
}

/// Scenario: a container-launch failure is retried once despite an
/// exhausted retry budget, with a fresh run id.
#[tokio::test]
async fn fabric_launch_failure_retries_with_fresh_run_id() {
    let rig = test_rig();
    let handler = rig.handler();
    handler
        .enqueue_gangs(
            "respool11",
            vec![vec![TestTask::cpu(0, 1.0).max_failures(0).spec("respool11")]],
        )
        .unwrap();
    let id = TaskId::new_test(0);
    rig.force_state(id, TaskState::Launched);

    handler.notify_task_updates(vec![TaskStatusUpdate {
        task_id: id,
        state: TaskState::Failed,
        reason: Some(REASON_CONTAINER_LAUNCH_FAILED.to_string()),
        message: None,
        offset: 1,
    }]);

    let task = rig.tracker.get(id).unwrap();
    assert_eq!(task.state(), TaskState::Pending);
    let runtime = task.runtime();
    assert_eq!(runtime.run_id, crate::RunId::new(1));
    assert_eq!(runtime.prev_run_id, Some(crate::RunId::new(0)));
}

/// Scenario: enqueue a gang, kill all of it; everything converges to
/// KILLED with the allocation returned.
#[tokio::test]
async fn enqueue_then_kill_converges() {
    let rig = test_rig();
    let handler = rig.handler();
    let pool = rig.tree.get("respool11").unwrap();
    pool.set_entitlement(cpu(10.0));
    handler
        .enqueue_gangs(
            "respool11",
            vec![vec![
                TestTask::cpu(0, 2.0).spec("respool11"),
                TestTask::cpu(1, 2.0).spec("respool11"),
            ]],
        )
        .unwrap();
    // One of them already got admitted.
    rig.scheduler.schedule_cycle(Instant::now());

    let response = handler
        .kill_tasks(vec![TaskId::new_test(0), TaskId::new_test(1)])
        .await
        .unwrap();
    assert_eq!(response.killed.len(), 2);
    for id in [TaskId::new_test(0), TaskId::new_test(1)] {
        assert_eq!(rig.tracker.get(id).unwrap().state(), TaskState::Killed);
    }
    assert!(pool.allocation().total.is_zero());
    assert!(!pool.has_queued_work());
}
