use crate::api::{HostManager, Placement, Store};
use crate::common::queue::WaitQueue;
use crate::config::{RmConfig, StrategyName};
use crate::entitlement::EntitlementCalculator;
use crate::handler::ServiceHandler;
use crate::placement::{
    BatchStrategy, LabelStrategy, OfferService, PlacementEngine, PlacementStrategy, Reserver,
};
use crate::preemption::Preemptor;
use crate::recovery::{self, RecoveryStats};
use crate::respool::ResTree;
use crate::task::kill::KillCoordinator;
use crate::task::scheduler::{PlacementQueues, TaskScheduler};
use crate::task::tracker::{runtime_writeback_loop, Tracker};
use crate::{Result, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The resource-manager core, owning the pool tree, the task tracker and
/// the four periodic loops. Created on leadership gain and torn down on
/// loss; there are no process-wide singletons behind it.
pub struct ResourceManager {
    config: RmConfig,
    store: Arc<dyn Store>,
    tree: Arc<ResTree>,
    tracker: Arc<Tracker>,
    queues: Arc<PlacementQueues>,
    placements: Arc<WaitQueue<Placement>>,
    preemption_queue: Arc<WaitQueue<TaskId>>,
    scheduler: Arc<TaskScheduler>,
    calculator: Arc<EntitlementCalculator>,
    preemptor: Arc<Preemptor>,
    engine: Arc<PlacementEngine>,
    handler: Arc<ServiceHandler>,
    cancel: Mutex<Option<CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(config: RmConfig, store: Arc<dyn Store>, host_manager: Arc<dyn HostManager>) -> Self {
        let tree = Arc::new(ResTree::new());
        let tracker = Arc::new(Tracker::new(tree.clone(), config.rm_task.terminal_grace));
        let queues = Arc::new(PlacementQueues::new(config.scheduler_queue_capacity));
        let placements = Arc::new(WaitQueue::new(
            "placements-out",
            config.placement_output_capacity,
        ));
        let preemption_queue = Arc::new(WaitQueue::new(
            "preemption",
            config.preemption_queue_capacity,
        ));
        let kill = Arc::new(KillCoordinator::new(
            tree.clone(),
            tracker.clone(),
            host_manager.clone(),
            config.rm_task.max_kill_attempts,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            tree.clone(),
            tracker.clone(),
            queues.clone(),
            config.clone(),
        ));
        let offer_service = Arc::new(OfferService::new(
            host_manager.clone(),
            tracker.clone(),
            config.placement.fetch_offer_tasks,
        ));
        let reserver = Arc::new(Reserver::new(
            tracker.clone(),
            config.placement.reservation_threshold,
            config.placement.reservation_timeout,
        ));
        let strategy: Arc<dyn PlacementStrategy> = match config.placement.strategy {
            StrategyName::Batch => Arc::new(BatchStrategy),
            StrategyName::Label => Arc::new(LabelStrategy),
        };
        let engine = Arc::new(PlacementEngine::new(
            queues.clone(),
            tracker.clone(),
            scheduler.clone(),
            offer_service,
            strategy,
            reserver,
            placements.clone(),
            config.placement.clone(),
        ));
        let calculator = Arc::new(EntitlementCalculator::new(
            tree.clone(),
            host_manager.clone(),
            config.entitlement_calculation_period,
        ));
        let preemptor = Arc::new(Preemptor::new(
            tree.clone(),
            tracker.clone(),
            kill.clone(),
            config.preemption.clone(),
            preemption_queue.clone(),
        ));
        let handler = Arc::new(ServiceHandler::new(
            tree.clone(),
            tracker.clone(),
            queues.clone(),
            placements.clone(),
            preemption_queue.clone(),
            kill,
        ));
        Self {
            config,
            store,
            tree,
            tracker,
            queues,
            placements,
            preemption_queue,
            scheduler,
            calculator,
            preemptor,
            engine,
            handler,
            cancel: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn handler(&self) -> Arc<ServiceHandler> {
        self.handler.clone()
    }

    pub fn tree(&self) -> Arc<ResTree> {
        self.tree.clone()
    }

    pub fn tracker(&self) -> Arc<Tracker> {
        self.tracker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Leadership gained: recover state from the store, then start the
    /// periodic loops. A store failure aborts the start and the caller
    /// must refuse leadership.
    pub async fn start(&self) -> Result<RecoveryStats> {
        if self.is_running() {
            return Ok(RecoveryStats::default());
        }
        log::info!("Resource manager starting");
        self.handler.set_leader(true);
        let stats = match recovery::recover(
            self.store.as_ref(),
            &self.tree,
            &self.tracker,
            &self.handler,
        )
        .await
        {
            Ok(stats) => stats,
            Err(e) => {
                self.handler.set_leader(false);
                log::error!("Recovery failed, refusing leadership: {e}");
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(
            self.calculator.clone().run_loop(cancel.child_token()),
        ));
        handles.push(tokio::spawn(
            self.scheduler.clone().run_loop(cancel.child_token()),
        ));
        // Runtime write-back rides the scheduling period; it flushes once
        // more on cancellation so shutdown leaves the store current.
        handles.push(tokio::spawn(runtime_writeback_loop(
            self.tracker.clone(),
            self.store.clone(),
            self.config.task_scheduling_period,
            cancel.child_token(),
        )));
        if self.config.preemption.enabled {
            handles.push(tokio::spawn(
                self.preemptor.clone().run_loop(cancel.child_token()),
            ));
        }
        handles.extend(self.engine.spawn_workers(&cancel.child_token()));
        *self.cancel.lock() = Some(cancel);
        log::info!("Resource manager started");
        Ok(stats)
    }

    /// Leadership lost or graceful shutdown: cancel every loop and wait up
    /// to the grace period for them to wind down.
    pub async fn stop(&self) {
        let Some(cancel) = self.cancel.lock().take() else {
            return;
        };
        log::info!("Resource manager stopping");
        self.handler.set_leader(false);
        cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let shutdown = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.grace_period, shutdown)
            .await
            .is_err()
        {
            log::warn!(
                "Loops did not stop within the grace period of {:?}",
                self.config.grace_period
            );
        }
        log::info!("Resource manager stopped");
    }

    /// Depth of the internal queues, for status reporting.
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (
            self.queues.len(),
            self.placements.len(),
            self.preemption_queue.len(),
        )
    }
}
