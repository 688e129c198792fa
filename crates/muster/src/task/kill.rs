use crate::api::HostManager;
use crate::respool::ResTree;
use crate::task::state::TaskState;
use crate::task::tracker::Tracker;
use crate::{Error, Result, TaskId};
use std::sync::Arc;

pub const REASON_KILL_FAILED: &str = "KillFailed";

/// The one kill path: user-initiated kills and preemption kills both go
/// through here so queue cleanup, fabric RPCs and retry caps behave the
/// same way.
pub struct KillCoordinator {
    tree: Arc<ResTree>,
    tracker: Arc<Tracker>,
    host_manager: Arc<dyn HostManager>,
    max_kill_attempts: u32,
}

impl KillCoordinator {
    pub fn new(
        tree: Arc<ResTree>,
        tracker: Arc<Tracker>,
        host_manager: Arc<dyn HostManager>,
        max_kill_attempts: u32,
    ) -> Self {
        Self {
            tree,
            tracker,
            host_manager,
            max_kill_attempts,
        }
    }

    /// Kill one task. Queued work dies locally (and its gang shrinks);
    /// launched work is transitioned to KILLING and a fabric kill is
    /// issued. The fabric ack arrives later as a status event.
    pub async fn kill_task(&self, id: TaskId, reason: &str) -> Result<()> {
        let task = self.tracker.get(id).ok_or(Error::TaskNotFound(id))?;
        let state = task.state();
        match state {
            s if s.is_terminal() => Ok(()),
            s if s.kill_is_local() => {
                self.kill_local(id, reason).await;
                Ok(())
            }
            // KILLING included: a repeated request retries the fabric RPC.
            _ => self.kill_remote(id, reason).await,
        }
    }

    /// Kill of a task that never reached a host: drop it from its queue
    /// and mark it KILLED directly.
    async fn kill_local(&self, id: TaskId, reason: &str) {
        let Some(task) = self.tracker.get(id) else {
            return;
        };
        let gang_id = task.gang;
        if let Some(gang) = self.tracker.gang(gang_id) {
            if let Ok(pool) = self.tree.get(&gang.pool) {
                // If the gang is still queued it comes out whole; surviving
                // members return to PENDING off-queue and are re-enqueued as
                // a smaller gang by the scheduler.
                if pool.remove_gang(gang_id).is_some() {
                    for member in &gang.tasks {
                        if let Some(member_task) = self.tracker.get(*member) {
                            member_task.runtime().in_queue = false;
                        }
                    }
                }
            }
        }
        self.tracker.remove_gang_member(gang_id, id);
        let _ = self
            .tracker
            .transition(id, TaskState::Killed, Some(reason.to_string()));
    }

    /// Kill of launched work: KILLING plus a host-manager kill RPC. RPC
    /// failures are retried on subsequent calls up to the configured cap,
    /// then surfaced as `KillFailed`.
    async fn kill_remote(&self, id: TaskId, reason: &str) -> Result<()> {
        let task = self.tracker.get(id).ok_or(Error::TaskNotFound(id))?;
        if task.state() != TaskState::Killing {
            self.tracker
                .transition(id, TaskState::Killing, Some(reason.to_string()))?;
        }
        match self.host_manager.kill_tasks(vec![id]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let attempts = {
                    let mut runtime = task.runtime();
                    runtime.kill_attempts += 1;
                    runtime.kill_attempts
                };
                if attempts >= self.max_kill_attempts {
                    log::error!("Kill of task {id} failed {attempts} times, giving up: {e}");
                    Err(Error::GenericError(REASON_KILL_FAILED.to_string()))
                } else {
                    log::warn!("Kill of task {id} failed (attempt {attempts}): {e}");
                    Err(e)
                }
            }
        }
    }
}
