use crate::api::{ResourcePoolConfig, StoredResourcePool};
use crate::common::resources::{ResourceKind, RESOURCE_EPS};
use crate::respool::pool::ResPool;
use crate::{Error, Map, PoolId, Result, Set};
use parking_lot::RwLock;
use std::sync::Arc;

/// Id of the implicit root pool. The root is created with the tree and is
/// never stored in the external config store.
pub const ROOT_POOL_ID: &str = "root";

/// The hierarchical pool structure. Nodes refer to each other by id, never
/// by direct handle, so the tree map owns every node exactly once.
///
/// The tree-level lock orders all topology mutations; per-node state has
/// its own lock inside [`ResPool`].
pub struct ResTree {
    pools: RwLock<Map<PoolId, Arc<ResPool>>>,
}

impl Default for ResTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ResTree {
    pub fn new() -> Self {
        let mut pools = Map::new();
        pools.insert(
            ROOT_POOL_ID.to_string(),
            Arc::new(ResPool::new_root(ROOT_POOL_ID.to_string())),
        );
        Self {
            pools: RwLock::new(pools),
        }
    }

    /// Build the tree from the stored pool configs (leadership gain).
    /// Parents may appear after their children in the input; insertion
    /// iterates until it stops making progress.
    pub fn build(&self, stored: Vec<StoredResourcePool>) -> Result<()> {
        let mut remaining = stored;
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for pool in remaining {
                let parent_known = match &pool.config.parent {
                    Some(parent) => self.pools.read().contains_key(parent),
                    None => false,
                };
                if parent_known {
                    self.upsert(pool.id, pool.config)?;
                } else {
                    deferred.push(pool);
                }
            }
            if deferred.len() == before {
                let ids: Vec<&str> = deferred.iter().map(|p| p.id.as_str()).collect();
                return Err(Error::InvalidPoolConfig {
                    pool: ids.join(","),
                    reason: "unresolvable parent pool".to_string(),
                });
            }
            remaining = deferred;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<ResPool>> {
        self.pools
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pools.read().contains_key(id)
    }

    pub fn root(&self) -> Arc<ResPool> {
        self.get(ROOT_POOL_ID).expect("root pool missing")
    }

    /// Resolve a "/"-separated path of pool names rooted at "/".
    pub fn get_by_path(&self, path: &str) -> Result<Arc<ResPool>> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = current
                .children()
                .into_iter()
                .filter_map(|id| self.get(&id).ok())
                .find(|child| child.name() == segment);
            match next {
                Some(child) => current = child,
                None => return Err(Error::PoolNotFound(path.to_string())),
            }
        }
        Ok(current)
    }

    /// Path of a pool from the root, "/"-separated.
    pub fn path_of(&self, id: &str) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = self.get(id)?;
        loop {
            match current.parent() {
                Some(parent) => {
                    segments.push(current.name());
                    current = self.get(&parent)?;
                }
                None => break,
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub fn pools(&self) -> Vec<Arc<ResPool>> {
        self.pools.read().values().cloned().collect()
    }

    pub fn leaves(&self) -> Vec<Arc<ResPool>> {
        self.pools
            .read()
            .values()
            .filter(|p| p.is_leaf())
            .cloned()
            .collect()
    }

    /// Leaf pools of the subtree rooted at `id` (including `id` itself
    /// when it is a leaf).
    pub fn leaves_under(&self, id: &str) -> Vec<Arc<ResPool>> {
        let pools = self.pools.read();
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(pool) = pools.get(&current) {
                let children = pool.children();
                if children.is_empty() {
                    out.push(pool.clone());
                } else {
                    stack.extend(children);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        // The root alone does not count as content.
        self.len() <= 1
    }

    /// Create or update a pool. The whole changed subtree is validated
    /// before anything is committed; on error the tree is unchanged.
    pub fn upsert(&self, id: PoolId, config: ResourcePoolConfig) -> Result<()> {
        let mut pools = self.pools.write();
        self.validate_upsert(&pools, &id, &config)?;

        let parent_id = config.parent.clone().expect("validated parent");
        match pools.get(&id) {
            Some(existing) => {
                let old_parent = existing.parent();
                existing.apply_config(&config);
                if old_parent.as_deref() != Some(parent_id.as_str()) {
                    if let Some(old_parent) = old_parent {
                        if let Some(p) = pools.get(&old_parent) {
                            p.remove_child(&id);
                        }
                    }
                    pools
                        .get(&parent_id)
                        .expect("validated parent")
                        .add_child(id.clone());
                }
                log::info!("Updated resource pool {id}");
            }
            None => {
                let pool = Arc::new(ResPool::new(id.clone(), &config));
                pools
                    .get(&parent_id)
                    .expect("validated parent")
                    .add_child(id.clone());
                pools.insert(id.clone(), pool);
                log::info!("Created resource pool {id}");
            }
        }
        Ok(())
    }

    fn validate_upsert(
        &self,
        pools: &Map<PoolId, Arc<ResPool>>,
        id: &PoolId,
        config: &ResourcePoolConfig,
    ) -> Result<()> {
        let invalid = |reason: String| Error::InvalidPoolConfig {
            pool: id.clone(),
            reason,
        };
        if id.is_empty() || id == ROOT_POOL_ID {
            return Err(invalid("reserved pool id".to_string()));
        }
        let parent_id = config
            .parent
            .as_ref()
            .ok_or_else(|| invalid("pool must have a resolvable parent".to_string()))?;
        let parent = pools
            .get(parent_id)
            .ok_or_else(|| invalid(format!("parent pool {parent_id} not found")))?;

        // Reparenting below one of the pool's own descendants would cut a
        // cycle into the tree.
        if self.is_descendant(pools, id, parent_id) || parent_id == id {
            return Err(invalid(format!("parent {parent_id} is a descendant")));
        }

        // A leaf holding queued work cannot become an internal node.
        if parent.is_leaf() && parent.has_queued_work() {
            return Err(invalid(format!(
                "parent pool {parent_id} is a leaf with queued tasks"
            )));
        }

        let reservation = config.reservation();
        let limit = config.limit();
        for kind in ResourceKind::ALL {
            if reservation.get(kind) < 0.0 || limit.get(kind) < 0.0 {
                return Err(invalid(format!("negative {kind} resource")));
            }
            if reservation.get(kind) > limit.get(kind) + RESOURCE_EPS {
                return Err(invalid(format!(
                    "{kind} reservation {} exceeds limit {}",
                    reservation.get(kind),
                    limit.get(kind)
                )));
            }
        }

        // Sibling reservations may not oversubscribe the parent's own
        // reservation. The root has no stored reservation (its budget is
        // the cluster capacity), so pools directly under it are exempt.
        if parent_id != ROOT_POOL_ID {
            let mut sibling_sum = reservation;
            for child_id in parent.children() {
                if child_id == *id {
                    continue;
                }
                if let Some(child) = pools.get(&child_id) {
                    sibling_sum += child.reservation();
                }
            }
            let parent_reservation = parent.reservation();
            if let Some(kind) = sibling_sum.exceeds(&parent_reservation) {
                return Err(invalid(format!(
                    "children {kind} reservations {} exceed parent reservation {}",
                    sibling_sum.get(kind),
                    parent_reservation.get(kind)
                )));
            }
        }
        Ok(())
    }

    fn is_descendant(
        &self,
        pools: &Map<PoolId, Arc<ResPool>>,
        ancestor: &str,
        candidate: &str,
    ) -> bool {
        let mut stack = vec![ancestor.to_string()];
        let mut seen: Set<PoolId> = Set::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(pool) = pools.get(&current) {
                for child in pool.children() {
                    if child == candidate {
                        return true;
                    }
                    stack.push(child);
                }
            }
        }
        false
    }

    /// Remove a pool. Only leaves without queued or admitted work may go;
    /// callers additionally ensure no tracked tasks reference the pool.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut pools = self.pools.write();
        if id == ROOT_POOL_ID {
            return Err(Error::InvalidArgument(
                "root pool cannot be deleted".to_string(),
            ));
        }
        let pool = pools
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(id.to_string()))?;
        if !pool.is_leaf() {
            return Err(Error::InvalidArgument(format!(
                "pool {id} still has child pools"
            )));
        }
        if pool.has_queued_work() || !pool.allocation().total.is_zero() {
            return Err(Error::InvalidArgument(format!(
                "pool {id} still has active tasks"
            )));
        }
        if let Some(parent) = pool.parent() {
            if let Some(parent) = pools.get(&parent) {
                parent.remove_child(&id.to_string());
            }
        }
        pools.remove(id);
        log::info!("Deleted resource pool {id}");
        Ok(())
    }
}
