//! Rebuilds the pool tree and the task tracker from the external store on
//! leadership gain. The queues themselves are not persisted; everything is
//! reconstructed from the durable job and task records.

use crate::api::{JobState, Store, StoredJobConfig, StoredTask};
use crate::handler::ServiceHandler;
use crate::respool::{Gang, ResTree};
use crate::task::rmtask::{RmTask, TaskFlags, TaskSpec};
use crate::task::state::TaskState;
use crate::task::tracker::{gang_kind_of, Tracker};
use crate::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub jobs_scanned: usize,
    pub tasks_requeued: usize,
    pub tasks_running: usize,
    pub tasks_skipped: usize,
}

/// States that go back into their pool's pending queue. Anything that was
/// already handed to a host is accounted as allocation instead and waits
/// for status events.
fn is_queueable(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Pending | TaskState::Ready | TaskState::Placing
    )
}

fn holds_host(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Placed
            | TaskState::Launching
            | TaskState::Launched
            | TaskState::Starting
            | TaskState::Running
            | TaskState::Killing
            | TaskState::Preempting
    )
}

/// Run recovery. Idempotent: a second run against the same store state
/// finds every task already tracked and changes nothing. Store failures
/// are returned as errors; the caller must refuse leadership on them.
pub async fn recover(
    store: &dyn Store,
    tree: &Arc<ResTree>,
    tracker: &Arc<Tracker>,
    handler: &ServiceHandler,
) -> Result<RecoveryStats> {
    let pools = store.get_all_resource_pools().await?;
    log::info!("Recovery: loading {} resource pool(s)", pools.len());
    tree.build(pools)?;

    let jobs = store
        .get_jobs_by_states(JobState::NON_TERMINAL.to_vec())
        .await?;
    log::info!("Recovery: scanning {} non-terminal job(s)", jobs.len());

    let mut stats = RecoveryStats::default();
    for job in jobs {
        let runtime = store.get_job_runtime(job).await?;
        if runtime.is_terminal() {
            continue;
        }
        stats.jobs_scanned += 1;
        let config = store.get_job_config(job).await?;
        if !tree.contains(&config.respool) {
            return Err(Error::InvalidPoolConfig {
                pool: config.respool.clone(),
                reason: format!("job {job} references an unknown pool"),
            });
        }
        let tasks = store
            .get_tasks_for_job_by_range(job, 0, config.instance_count)
            .await?;
        recover_job(tracker, tree, handler, &config, tasks, &mut stats)?;
    }
    log::info!(
        "Recovery done: {} job(s), {} task(s) requeued, {} running, {} skipped",
        stats.jobs_scanned,
        stats.tasks_requeued,
        stats.tasks_running,
        stats.tasks_skipped
    );
    Ok(stats)
}

fn recover_job(
    tracker: &Arc<Tracker>,
    tree: &Arc<ResTree>,
    handler: &ServiceHandler,
    config: &StoredJobConfig,
    tasks: Vec<StoredTask>,
    stats: &mut RecoveryStats,
) -> Result<()> {
    let mut queueable = Vec::new();
    for stored in tasks {
        if is_queueable(stored.state) {
            queueable.push(stored);
        } else if holds_host(stored.state) {
            recover_placed_task(tracker, tree, handler, config, stored, stats);
        } else {
            // INITIALIZED tasks belong to the job manager's goal-state
            // convergence; terminal tasks need no queue slot.
            stats.tasks_skipped += 1;
        }
    }
    if queueable.is_empty() {
        return Ok(());
    }

    // Jobs with a minimum running instance count gang-schedule that many
    // tasks together; everything else is one gang per task.
    let gangs: Vec<Vec<TaskSpec>> = if config.min_instances > 1 {
        vec![queueable.iter().map(|t| spec_of(config, t)).collect()]
    } else {
        queueable
            .iter()
            .map(|t| vec![spec_of(config, t)])
            .collect()
    };
    let response = handler.enqueue_gangs(&config.respool, gangs)?;
    // On a re-run every task already exists; the rejections are the
    // idempotence path, not an error.
    stats.tasks_requeued += queueable.len() - response.failed.len();
    stats.tasks_skipped += response.failed.len();
    Ok(())
}

fn recover_placed_task(
    tracker: &Arc<Tracker>,
    tree: &Arc<ResTree>,
    handler: &ServiceHandler,
    config: &StoredJobConfig,
    stored: StoredTask,
    stats: &mut RecoveryStats,
) {
    let spec = spec_of(config, &stored);
    let gang_id = handler.next_gang_id();
    let task = Arc::new(RmTask::new(spec.clone(), gang_id, stored.state));
    if !tracker.add_task(task) {
        // Second recovery run: already tracked and accounted.
        stats.tasks_skipped += 1;
        return;
    }
    tracker.register_gang(Gang {
        id: gang_id,
        pool: config.respool.clone(),
        tasks: vec![spec.id],
        demand: spec.demand,
        priority: spec.priority,
        kind: gang_kind_of(spec.flags),
        task_type: spec.task_type,
        seq: 0,
    });
    if let Some(host) = stored.host {
        tracker.set_placement(spec.id, host, Vec::new());
    }
    if let Ok(pool) = tree.get(&config.respool) {
        pool.add_allocation(gang_kind_of(spec.flags), spec.demand);
    }
    stats.tasks_running += 1;
}

fn spec_of(config: &StoredJobConfig, stored: &StoredTask) -> TaskSpec {
    let mut flags = TaskFlags::empty();
    flags.set(TaskFlags::PREEMPTIBLE, config.preemptible);
    flags.set(TaskFlags::CONTROLLER, config.controller);
    flags.set(TaskFlags::REVOCABLE, config.revocable);
    TaskSpec {
        id: stored.id,
        pool: config.respool.clone(),
        demand: stored.demand,
        num_ports: stored.num_ports,
        priority: config.priority,
        flags,
        task_type: config.task_type,
        host_labels: Vec::new(),
        max_failures: config.max_failures,
    }
}
