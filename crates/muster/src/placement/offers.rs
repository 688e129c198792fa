use crate::api::{HostFilter, HostManager};
use crate::placement::strategy::OfferLease;
use crate::task::tracker::Tracker;
use std::sync::Arc;

const FAILED_TO_ACQUIRE: &str = "failed to acquire host offers";

/// Manages the offers used by a placement round: acquisition from the
/// host manager, optional enrichment with the tasks already running on
/// each host, and the release of whatever went unused.
pub struct OfferService {
    host_manager: Arc<dyn HostManager>,
    tracker: Arc<Tracker>,
    fetch_offer_tasks: bool,
}

impl OfferService {
    pub fn new(
        host_manager: Arc<dyn HostManager>,
        tracker: Arc<Tracker>,
        fetch_offer_tasks: bool,
    ) -> Self {
        Self {
            host_manager,
            tracker,
            fetch_offer_tasks,
        }
    }

    /// Fetch a batch of offers matching the filter. Failures degrade to an
    /// empty batch: the round simply finds nothing and retries.
    pub async fn acquire(&self, filter: HostFilter) -> Vec<OfferLease> {
        let acquired = match self.host_manager.acquire_host_offers(filter).await {
            Ok(acquired) => acquired,
            Err(e) => {
                log::error!("{FAILED_TO_ACQUIRE}: {e}");
                return Vec::new();
            }
        };
        if !acquired.filter_counts.is_empty() {
            log::debug!(
                "Offer acquisition filtered hosts: {:?}",
                serde_json::to_string(&acquired.filter_counts).unwrap_or_default()
            );
        }
        acquired
            .offers
            .into_iter()
            .map(|offer| {
                let mut lease = OfferLease::new(offer);
                if self.fetch_offer_tasks {
                    lease.running_tasks = self.tracker.tasks_by_host(&lease.offer.hostname);
                }
                lease
            })
            .collect()
    }

    /// Return unused offers to the host manager.
    pub async fn release(&self, leases: Vec<OfferLease>) {
        if leases.is_empty() {
            return;
        }
        let offers = leases.into_iter().map(|lease| lease.offer).collect();
        if let Err(e) = self.host_manager.release_host_offers(offers).await {
            log::error!("Release of host offers failed: {e}");
        }
    }
}
