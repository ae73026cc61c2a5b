//! Instance cache.
//!
//! One timed entry per `(resource group, scale set)`, each holding the
//! scale set's instances keyed by lowercased computer name. Instances that are
//! being deleted, or that vanished from the last listing, are kept as
//! tombstones (no VM document) until they are older than the TTL, so lookups
//! for them do not trigger a listing each time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{ReadMode, TimedCache};
use crate::client::ComputeClient;
use crate::error::{CloudError, Result};
use crate::lockmap::LockMap;
use crate::model::VirtualMachine;

/// A scale-set instance as last observed.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub resource_group: String,
    pub scale_set: String,
    pub instance_id: String,
    /// `None` marks a tombstone.
    pub vm: Option<Arc<VirtualMachine>>,
    pub last_update: Instant,
}

impl InstanceRecord {
    pub fn is_tombstone(&self) -> bool {
        self.vm.is_none()
    }
}

/// Instances of one scale set keyed by lowercased computer name.
pub type InstanceMap = HashMap<String, InstanceRecord>;

/// Cache key of a scale set's instances.
pub fn cache_key(resource_group: &str, scale_set: &str) -> String {
    format!(
        "{}/{}",
        resource_group.to_lowercase(),
        scale_set.to_lowercase()
    )
}

fn scale_set_of_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

pub struct InstanceCache {
    compute: Arc<dyn ComputeClient>,
    cache: TimedCache<InstanceMap>,
    /// Entry locks for read-retry and in-place updates, separate from the
    /// cache's own refresh locks.
    entry_locks: LockMap,
}

impl InstanceCache {
    pub fn new(compute: Arc<dyn ComputeClient>, ttl: Duration) -> Self {
        Self {
            compute,
            cache: TimedCache::new(ttl),
            entry_locks: LockMap::new(),
        }
    }

    async fn list(
        &self,
        resource_group: &str,
        scale_set: &str,
        previous: Option<Arc<InstanceMap>>,
    ) -> Result<Option<InstanceMap>> {
        let vms = self
            .compute
            .list_scale_set_vms(resource_group, scale_set)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CloudError::InstanceNotFound(format!(
                        "scale set {scale_set} in {resource_group}: {e}"
                    ))
                } else {
                    e
                }
            })?;

        let ttl = self.cache.ttl();
        let now = Instant::now();
        let mut old: InstanceMap = previous.map(|p| (*p).clone()).unwrap_or_default();
        let mut instances = InstanceMap::with_capacity(vms.len());

        for vm in vms {
            let Some(computer_name) = vm.computer_name.as_deref() else {
                warn!("failed to get computerName for instance of scale set {}", scale_set);
                continue;
            };
            let computer_name = computer_name.to_lowercase();
            if vm.network_profile.is_none() {
                warn!(
                    "skip caching instance {} since its network profile hasn't initialized yet",
                    computer_name
                );
                continue;
            }

            let instance_id = vm.instance_id.clone().unwrap_or_default();
            let vm = if vm.is_deleting() {
                debug!("instance {} is under deletion, caching a tombstone", computer_name);
                None
            } else {
                Some(Arc::new(vm))
            };

            old.remove(&computer_name);
            instances.insert(
                computer_name,
                InstanceRecord {
                    resource_group: resource_group.to_string(),
                    scale_set: scale_set.to_string(),
                    instance_id,
                    vm,
                    last_update: now,
                },
            );
        }

        // Keep vanished instances as tombstones to avoid re-listing for them.
        for (name, record) in old {
            if record.is_tombstone() && record.last_update.elapsed() > ttl {
                debug!("dropping expired tombstone {}", name);
                continue;
            }
            let last_update = if record.is_tombstone() {
                record.last_update
            } else {
                now
            };
            instances.insert(
                name,
                InstanceRecord {
                    vm: None,
                    last_update,
                    ..record
                },
            );
        }

        Ok(Some(instances))
    }

    /// All instances of a scale set.
    pub async fn instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        mode: ReadMode,
    ) -> Result<Arc<InstanceMap>> {
        let key = cache_key(resource_group, scale_set);
        self.cache
            .get(&key, mode, |previous| {
                self.list(resource_group, scale_set, previous)
            })
            .await?
            .ok_or_else(|| {
                CloudError::unexpected(format!(
                    "instance cache entry for {key} returned no data"
                ))
            })
    }

    /// Record of a node in a scale set; `None` if the node is not listed.
    async fn lookup(
        &self,
        resource_group: &str,
        scale_set: &str,
        node_name: &str,
        mode: ReadMode,
    ) -> Result<Option<InstanceRecord>> {
        let instances = self.instances(resource_group, scale_set, mode).await?;
        Ok(instances.get(&node_name.to_lowercase()).cloned())
    }

    /// VM document of a node known to live in `scale_set`.
    ///
    /// A node missing from the cached listing triggers one forced refresh
    /// under the entry lock. Tombstones yield instance-not-found.
    pub async fn get_by_node_name(
        &self,
        resource_group: &str,
        scale_set: &str,
        node_name: &str,
        mode: ReadMode,
    ) -> Result<Arc<VirtualMachine>> {
        let mut record = self.lookup(resource_group, scale_set, node_name, mode).await?;

        if record.is_none() {
            let _guard = self.entry_locks.lock(&cache_key(resource_group, scale_set)).await;
            record = self.lookup(resource_group, scale_set, node_name, mode).await?;
            if record.is_none() {
                info!(
                    "Couldn't find instance with node name {}, refreshing the cache (scale set: {}, rg: {})",
                    node_name, scale_set, resource_group
                );
                record = self
                    .lookup(resource_group, scale_set, node_name, ReadMode::ForceRefresh)
                    .await?;
            }
        }

        match record.and_then(|r| r.vm) {
            Some(vm) => Ok(vm),
            None => {
                warn!("Unable to find node {}: instance not found", node_name);
                Err(CloudError::InstanceNotFound(node_name.to_string()))
            }
        }
    }

    /// VM document by instance id.
    pub async fn get_by_instance_id(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        mode: ReadMode,
    ) -> Result<Arc<VirtualMachine>> {
        let find = |instances: &InstanceMap| {
            instances
                .values()
                .find(|r| {
                    r.resource_group.eq_ignore_ascii_case(resource_group)
                        && r.scale_set.eq_ignore_ascii_case(scale_set)
                        && r.instance_id.eq_ignore_ascii_case(instance_id)
                })
                .cloned()
        };

        let mut record = find(&*self.instances(resource_group, scale_set, mode).await?);
        if record.is_none() {
            info!(
                "Couldn't find instance {} of scale set {}, refreshing the cache",
                instance_id, scale_set
            );
            record = find(
                &*self
                    .instances(resource_group, scale_set, ReadMode::ForceRefresh)
                    .await?,
            );
        } else if record.as_ref().is_some_and(InstanceRecord::is_tombstone) {
            // The tombstone may be stale; honour the TTL.
            record = find(
                &*self
                    .instances(resource_group, scale_set, ReadMode::Default)
                    .await?,
            );
        }

        record
            .and_then(|r| r.vm)
            .ok_or_else(|| CloudError::InstanceNotFound(format!("{scale_set}/{instance_id}")))
    }

    /// Store a fresh VM document for a node, keeping the entry's age.
    pub async fn update_node(
        &self,
        resource_group: &str,
        scale_set: &str,
        node_name: &str,
        instance_id: &str,
        vm: VirtualMachine,
    ) {
        let key = cache_key(resource_group, scale_set);
        let _guard = self.entry_locks.lock(&key).await;
        let node_name = node_name.to_lowercase();
        let updated = self.cache.modify(&key, |instances| {
            let mut instances = instances.clone();
            instances.insert(
                node_name.clone(),
                InstanceRecord {
                    resource_group: resource_group.to_string(),
                    scale_set: scale_set.to_string(),
                    instance_id: instance_id.to_string(),
                    vm: Some(Arc::new(vm)),
                    last_update: Instant::now(),
                },
            );
            instances
        });
        if updated {
            debug!("updated cached instance {} in {}", node_name, key);
        }
    }

    /// Drop a node's entry so the next lookup re-lists its scale set.
    pub fn delete_node(&self, resource_group: &str, scale_set: &str, node_name: &str) {
        let key = cache_key(resource_group, scale_set);
        let node_name = node_name.to_lowercase();
        self.cache.modify(&key, |instances| {
            let mut instances = instances.clone();
            instances.remove(&node_name);
            instances
        });
    }

    /// Drop a node from every loaded scale set.
    pub fn forget_node(&self, node_name: &str) {
        let node_name = node_name.to_lowercase();
        for key in self.cache.keys() {
            self.cache.modify(&key, |instances| {
                let mut instances = instances.clone();
                instances.remove(&node_name);
                instances
            });
        }
    }

    /// True if any loaded scale set lists the node, without refreshing.
    pub fn contains_node(&self, node_name: &str) -> bool {
        let node_name = node_name.to_lowercase();
        self.cache
            .peek_all()
            .iter()
            .any(|(_, instances)| instances.contains_key(&node_name))
    }

    /// Drop the instances of scale sets not in `scale_sets` (lowercased names).
    pub fn retain_scale_sets(&self, scale_sets: &HashSet<String>) {
        self.cache.retain(|key| {
            let keep = scale_sets.contains(scale_set_of_key(key));
            if !keep {
                info!("removing {} from instance cache", key);
            }
            keep
        });
    }

    pub fn invalidate(&self, resource_group: &str, scale_set: &str) {
        self.cache.delete(&cache_key(resource_group, scale_set));
    }

    pub fn keys(&self) -> Vec<String> {
        self.cache.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCloud;
    use crate::model::NetworkProfile;

    fn make_vm(computer_name: &str, instance_id: &str, state: &str) -> VirtualMachine {
        VirtualMachine {
            id: format!(
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/pool/virtualMachines/{instance_id}"
            ),
            name: format!("pool_{instance_id}"),
            instance_id: Some(instance_id.to_string()),
            computer_name: Some(computer_name.to_string()),
            network_profile: Some(NetworkProfile::default()),
            provisioning_state: Some(state.to_string()),
            ..Default::default()
        }
    }

    fn make_cache(cloud: &MemoryCloud) -> InstanceCache {
        InstanceCache::new(Arc::new(cloud.clone()), Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_instance_is_tombstone() {
        let cloud = MemoryCloud::new();
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000000", "0", "Succeeded"));
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000001", "1", "Deleting"));
        let cache = make_cache(&cloud);

        assert!(cache.get_by_node_name("rg", "pool", "POOL000000", ReadMode::Default).await.is_ok());
        let err = cache
            .get_by_node_name("rg", "pool", "pool000001", ReadMode::Default)
            .await
            .unwrap_err();
        assert!(err.is_instance_not_found());
        // The tombstone answers without another listing.
        assert_eq!(cloud.call_count("list_scale_set_vms"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_instances_being_created() {
        let cloud = MemoryCloud::new();
        let mut creating = make_vm("pool000002", "2", "Creating");
        creating.network_profile = None;
        cloud.put_scale_set_vm("rg", "pool", creating);
        let mut unnamed = make_vm("pool000003", "3", "Creating");
        unnamed.computer_name = None;
        cloud.put_scale_set_vm("rg", "pool", unnamed);
        let cache = make_cache(&cloud);

        let instances = cache.instances("rg", "pool", ReadMode::Default).await.unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_instance_becomes_tombstone_then_expires() {
        let cloud = MemoryCloud::new();
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000000", "0", "Succeeded"));
        let cache = make_cache(&cloud);
        cache.instances("rg", "pool", ReadMode::Default).await.unwrap();

        cloud.remove_scale_set_vm("rg", "pool", "0");
        let instances = cache.instances("rg", "pool", ReadMode::ForceRefresh).await.unwrap();
        let first = instances["pool000000"].clone();
        assert!(first.is_tombstone());

        // Refreshing again keeps the tombstone's original timestamp.
        tokio::time::advance(Duration::from_secs(300)).await;
        let instances = cache.instances("rg", "pool", ReadMode::ForceRefresh).await.unwrap();
        assert_eq!(instances["pool000000"].last_update, first.last_update);

        tokio::time::advance(Duration::from_secs(301)).await;
        let instances = cache.instances("rg", "pool", ReadMode::ForceRefresh).await.unwrap();
        assert!(!instances.contains_key("pool000000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_node_forces_refresh() {
        let cloud = MemoryCloud::new();
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000000", "0", "Succeeded"));
        let cache = make_cache(&cloud);
        cache.instances("rg", "pool", ReadMode::Default).await.unwrap();

        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000001", "1", "Succeeded"));
        let vm = cache
            .get_by_node_name("rg", "pool", "pool000001", ReadMode::Unsafe)
            .await
            .unwrap();
        assert_eq!(vm.instance_id.as_deref(), Some("1"));
        assert_eq!(cloud.call_count("list_scale_set_vms"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_by_instance_id() {
        let cloud = MemoryCloud::new();
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000005", "5", "Succeeded"));
        let cache = make_cache(&cloud);

        let vm = cache.get_by_instance_id("rg", "pool", "5", ReadMode::Unsafe).await.unwrap();
        assert_eq!(vm.computer_name.as_deref(), Some("pool000005"));
        assert!(cache
            .get_by_instance_id("rg", "pool", "9", ReadMode::Unsafe)
            .await
            .unwrap_err()
            .is_instance_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_node_and_gc() {
        let cloud = MemoryCloud::new();
        cloud.put_scale_set_vm("rg", "pool", make_vm("pool000000", "0", "Succeeded"));
        cloud.put_scale_set_vm("rg", "other", make_vm("other000000", "0", "Succeeded"));
        let cache = make_cache(&cloud);
        cache.instances("rg", "pool", ReadMode::Default).await.unwrap();
        cache.instances("rg", "other", ReadMode::Default).await.unwrap();
        assert!(cache.contains_node("pool000000"));

        cache.delete_node("rg", "pool", "pool000000");
        assert!(!cache.contains_node("pool000000"));

        cache.retain_scale_sets(&HashSet::from(["pool".to_string()]));
        assert_eq!(cache.keys(), vec!["rg/pool".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_scale_set_is_instance_not_found() {
        let cloud = MemoryCloud::new();
        let cache = make_cache(&cloud);
        let err = cache.instances("rg", "gone", ReadMode::Default).await.unwrap_err();
        assert!(err.is_instance_not_found());
    }
}
