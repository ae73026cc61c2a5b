//! VM-set dispatcher.
//!
//! Classifies node names, provider ids and IP-configuration ids into the
//! VM-set kind that owns them. Uniform scale-set instances are recognised by
//! their id grammar or computer-name suffix; availability-set and flex members
//! come from a side cache listing every standalone VM in the tracked resource
//! groups.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{ReadMode, TimedCache};
use crate::client::ComputeClient;
use crate::error::{CloudError, Result};
use crate::ids::{self, PROVIDER_ID_PREFIX};
use crate::instances::InstanceCache;
use crate::model::VmSetKind;
use crate::nodes::NodeProjection;

const NON_UNIFORM_NODES_KEY: &str = "k8sNonVmssUniformNodesKey";

/// Standalone VMs seen at the last refresh. Every entry is lowercased;
/// provider ids are stored without the `azure://` prefix.
#[derive(Debug, Clone, Default)]
pub struct NonUniformNodes {
    pub availability_set_nodes: HashSet<String>,
    pub flex_nodes: HashSet<String>,
    pub availability_set_provider_ids: HashSet<String>,
    pub flex_provider_ids: HashSet<String>,
    /// Cluster node names when the snapshot was taken.
    pub cluster_node_names: HashSet<String>,
}

fn normalize_provider_id(provider_id: &str) -> String {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .unwrap_or(provider_id)
        .to_lowercase()
}

pub struct Dispatcher {
    compute: Arc<dyn ComputeClient>,
    projection: Arc<NodeProjection>,
    instances: Arc<InstanceCache>,
    cache: TimedCache<NonUniformNodes>,
    /// Serializes classifications so concurrent misses refresh once.
    lock: Mutex<()>,
    disable_availability_set_nodes: bool,
    enable_flex_nodes: bool,
}

impl Dispatcher {
    pub fn new(
        compute: Arc<dyn ComputeClient>,
        projection: Arc<NodeProjection>,
        instances: Arc<InstanceCache>,
        ttl: Duration,
        disable_availability_set_nodes: bool,
        enable_flex_nodes: bool,
    ) -> Self {
        Self {
            compute,
            projection,
            instances,
            cache: TimedCache::new(ttl),
            lock: Mutex::new(()),
            disable_availability_set_nodes,
            enable_flex_nodes,
        }
    }

    fn uniform_only(&self) -> bool {
        self.disable_availability_set_nodes && !self.enable_flex_nodes
    }

    async fn scan(&self) -> Result<Option<NonUniformNodes>> {
        let mut nodes = NonUniformNodes::default();

        for resource_group in self.projection.resource_groups().await? {
            let vms = match self.compute.list_vms(&resource_group).await {
                Ok(vms) => vms,
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Skip caching standalone VMs for resource group {} due to error: {}",
                        resource_group, e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            for vm in vms {
                let Some(computer_name) = vm.computer_name.as_deref() else {
                    continue;
                };
                let computer_name = computer_name.to_lowercase();
                let provider_id = normalize_provider_id(&vm.id);
                if vm.scale_set_id.is_some() {
                    nodes.flex_nodes.insert(computer_name);
                    nodes.flex_provider_ids.insert(provider_id);
                } else {
                    nodes.availability_set_nodes.insert(computer_name);
                    nodes.availability_set_provider_ids.insert(provider_id);
                }
            }
        }

        nodes.cluster_node_names = self
            .projection
            .node_names()
            .await?
            .into_iter()
            .map(|n| n.to_lowercase())
            .collect();

        info!(
            availability_set = nodes.availability_set_nodes.len(),
            flex = nodes.flex_nodes.len(),
            "refreshed non-uniform nodes cache"
        );
        Ok(Some(nodes))
    }

    async fn non_uniform_nodes(&self, mode: ReadMode) -> Result<Arc<NonUniformNodes>> {
        self.cache
            .get(NON_UNIFORM_NODES_KEY, mode, |_| self.scan())
            .await?
            .ok_or_else(|| CloudError::unexpected("non-uniform nodes cache returned no data"))
    }

    /// Kind of the VM behind a node name.
    pub async fn classify_by_node_name(&self, node_name: &str, mode: ReadMode) -> Result<VmSetKind> {
        if self.uniform_only() {
            return Ok(VmSetKind::UniformScaleSet);
        }

        let _guard = self.lock.lock().await;
        let name = node_name.to_lowercase();
        let mut cached = self.non_uniform_nodes(mode).await?;

        // A node that joined after the snapshot was taken is unknown to it.
        if !cached.cluster_node_names.contains(&name) {
            if cached.availability_set_nodes.contains(&name) {
                return Ok(VmSetKind::AvailabilitySet);
            }
            if cached.flex_nodes.contains(&name) {
                return Ok(VmSetKind::FlexScaleSet);
            }
            if self.instances.contains_node(&name) {
                return Ok(VmSetKind::UniformScaleSet);
            }
            debug!("node {} is not in the non-uniform nodes snapshot, refreshing", node_name);
            cached = self.non_uniform_nodes(ReadMode::ForceRefresh).await?;
        }

        if cached.availability_set_nodes.contains(&name) {
            return Ok(VmSetKind::AvailabilitySet);
        }
        if cached.flex_nodes.contains(&name) {
            return Ok(VmSetKind::FlexScaleSet);
        }
        if ids::instance_id_from_computer_name(&name).is_some() {
            return Ok(VmSetKind::UniformScaleSet);
        }
        Ok(VmSetKind::Unknown)
    }

    /// Kind of the VM behind a provider id or VM resource id.
    pub async fn classify_by_provider_id(
        &self,
        provider_id: &str,
        mode: ReadMode,
    ) -> Result<VmSetKind> {
        if self.uniform_only() || ids::is_scale_set_instance_id(provider_id) {
            return Ok(VmSetKind::UniformScaleSet);
        }

        let _guard = self.lock.lock().await;
        let id = normalize_provider_id(provider_id);
        let lookup = |nodes: &NonUniformNodes| {
            if nodes.availability_set_provider_ids.contains(&id) {
                Some(VmSetKind::AvailabilitySet)
            } else if nodes.flex_provider_ids.contains(&id) {
                Some(VmSetKind::FlexScaleSet)
            } else {
                None
            }
        };

        if let Some(kind) = lookup(&*self.non_uniform_nodes(mode).await?) {
            return Ok(kind);
        }
        debug!("provider id {} is not cached, refreshing", provider_id);
        Ok(lookup(&*self.non_uniform_nodes(ReadMode::ForceRefresh).await?)
            .unwrap_or(VmSetKind::Unknown))
    }

    /// Kind of the VM owning a NIC IP configuration.
    pub async fn classify_by_ip_config_id(&self, ip_config_id: &str) -> Result<VmSetKind> {
        if ids::parse_scale_set_ip_config_id(ip_config_id).is_some() {
            return Ok(VmSetKind::UniformScaleSet);
        }
        let Some((_, nic_name)) = ids::parse_nic_ip_config_id(ip_config_id) else {
            return Err(CloudError::unexpected(format!(
                "can not extract nic name from ip configuration id {ip_config_id}"
            )));
        };
        if self.uniform_only() {
            return Ok(VmSetKind::UniformScaleSet);
        }

        let vm_name = nic_name.replacen("-nic", "", 1).to_lowercase();
        let cached = self.non_uniform_nodes(ReadMode::Unsafe).await?;
        if cached.availability_set_nodes.contains(&vm_name) {
            Ok(VmSetKind::AvailabilitySet)
        } else {
            Ok(VmSetKind::FlexScaleSet)
        }
    }

    pub fn invalidate(&self) {
        self.cache.delete(NON_UNIFORM_NODES_KEY);
    }
}
