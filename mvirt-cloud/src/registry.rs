//! Scale-set registry.
//!
//! A single timed entry holding every uniform scale set in the tracked
//! resource groups, keyed by lowercased scale-set name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{ReadMode, TimedCache};
use crate::client::ComputeClient;
use crate::error::{CloudError, Result};
use crate::ids;
use crate::instances::InstanceCache;
use crate::model::{OrchestrationMode, ScaleSet};
use crate::nodes::NodeProjection;

const SCALE_SETS_KEY: &str = "k8svmssKey";

/// A cached scale set with the resource group it was listed in.
#[derive(Debug, Clone)]
pub struct ScaleSetEntry {
    pub scale_set: ScaleSet,
    pub resource_group: String,
}

type ScaleSetMap = HashMap<String, ScaleSetEntry>;

/// Where a uniform instance lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub resource_group: String,
    pub scale_set: String,
}

pub struct ScaleSetRegistry {
    compute: Arc<dyn ComputeClient>,
    projection: Arc<NodeProjection>,
    instances: Arc<InstanceCache>,
    cache: TimedCache<ScaleSetMap>,
    put_vm_batch_size: usize,
}

impl ScaleSetRegistry {
    pub fn new(
        compute: Arc<dyn ComputeClient>,
        projection: Arc<NodeProjection>,
        instances: Arc<InstanceCache>,
        ttl: Duration,
        put_vm_batch_size: usize,
    ) -> Self {
        Self {
            compute,
            projection,
            instances,
            cache: TimedCache::new(ttl),
            put_vm_batch_size,
        }
    }

    async fn scan(&self) -> Result<Option<ScaleSetMap>> {
        let mut scale_sets = ScaleSetMap::new();
        let mut resource_group_not_found = false;

        for resource_group in self.projection.resource_groups().await? {
            let listed = match self.compute.list_scale_sets(&resource_group).await {
                Ok(listed) => listed,
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Skip caching scale sets for resource group {} due to error: {}",
                        resource_group, e
                    );
                    resource_group_not_found = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for scale_set in listed {
                if scale_set.name.is_empty() {
                    warn!("failed to get the name of scale set");
                    continue;
                }
                if scale_set.orchestration_mode == OrchestrationMode::Uniform {
                    scale_sets.insert(
                        scale_set.name.to_lowercase(),
                        ScaleSetEntry {
                            scale_set,
                            resource_group: resource_group.clone(),
                        },
                    );
                }
            }
        }

        if resource_group_not_found {
            let names: HashSet<String> = scale_sets.keys().cloned().collect();
            self.instances.retain_scale_sets(&names);
        }

        info!("refreshed scale set cache: {} scale sets", scale_sets.len());
        Ok(Some(scale_sets))
    }

    async fn scale_sets(&self, mode: ReadMode) -> Result<Arc<ScaleSetMap>> {
        self.cache
            .get(SCALE_SETS_KEY, mode, |_| self.scan())
            .await?
            .ok_or_else(|| CloudError::unexpected("scale set cache returned no data"))
    }

    /// Look up a scale set by name, forcing one refresh on a miss.
    pub async fn get(&self, name: &str, mode: ReadMode) -> Result<ScaleSetEntry> {
        let key = name.to_lowercase();
        if let Some(entry) = self.scale_sets(mode).await?.get(&key) {
            return Ok(entry.clone());
        }

        info!("Couldn't find scale set with name {}, refreshing the cache", name);
        self.scale_sets(ReadMode::ForceRefresh)
            .await?
            .get(&key)
            .cloned()
            .ok_or_else(|| CloudError::InstanceNotFound(format!("scale set {name}")))
    }

    /// Every cached uniform scale set.
    pub async fn all(&self, mode: ReadMode) -> Result<Vec<ScaleSetEntry>> {
        Ok(self.scale_sets(mode).await?.values().cloned().collect())
    }

    /// Names of the scale sets in a resource group that can host nodes.
    ///
    /// Skips scale sets without capacity and those without a VM template.
    pub async fn list(&self, resource_group: &str) -> Result<Vec<String>> {
        let listed = self.compute.list_scale_sets(resource_group).await?;
        let mut names = Vec::with_capacity(listed.len());
        for scale_set in listed {
            if scale_set.capacity == Some(0) {
                debug!("Capacity of scale set {} is 0, skipping", scale_set.name);
                continue;
            }
            if scale_set.vm_profile.is_none()
                || scale_set.orchestration_mode == OrchestrationMode::Flexible
            {
                debug!("scale set {} has no VM template, skipping", scale_set.name);
                continue;
            }
            names.push(scale_set.name);
        }
        Ok(names)
    }

    /// Find the scale set a node belongs to by its computer-name prefix.
    pub async fn node_identity(&self, node_name: &str, mode: ReadMode) -> Result<NodeIdentity> {
        let Some(stem) = ids::computer_name_stem(node_name) else {
            return Err(CloudError::InstanceNotFound(format!(
                "{node_name} is not a scale set instance"
            )));
        };

        let find = |scale_sets: &ScaleSetMap| {
            scale_sets
                .values()
                .find(|e| e.scale_set.computer_name_prefix().eq_ignore_ascii_case(stem))
                .map(|e| NodeIdentity {
                    node_name: node_name.to_lowercase(),
                    resource_group: e.resource_group.clone(),
                    scale_set: e.scale_set.name.clone(),
                })
        };

        if let Some(identity) = find(&*self.scale_sets(mode).await?) {
            return Ok(identity);
        }

        info!("Couldn't find scale set for node {}, refreshing the cache", node_name);
        find(&*self.scale_sets(ReadMode::ForceRefresh).await?).ok_or_else(|| {
            warn!("Unable to find node {}: instance not found", node_name);
            CloudError::InstanceNotFound(node_name.to_string())
        })
    }

    /// Concurrent instance updates allowed for a scale set; 0 or 1 means serial.
    pub async fn batch_size(&self, name: &str) -> Result<usize> {
        let entry = self.get(name, ReadMode::Default).await?;
        let size = if entry.scale_set.batch_operation_enabled() {
            self.put_vm_batch_size
        } else {
            0
        };
        debug!(scale_set = %name, size, "Fetch scale set batch size");
        Ok(size)
    }

    pub fn invalidate(&self) {
        self.cache.delete(SCALE_SETS_KEY);
    }
}
