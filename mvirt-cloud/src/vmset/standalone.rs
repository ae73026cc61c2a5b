//! Availability-set and flex scale-set members.
//!
//! Both kinds are plain VMs addressed by name. VM documents are cached per
//! resource group from one listing, indexed by computer name and VM name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{
    begin_storage_update, filter_detaching, interface_ips, node_in_vm_set, remove_backend_pool,
    select_ip_configuration, select_vm_set_names, with_attached_disks, with_detached_disks, zone_of,
    add_backend_pool, AttachOptions, CacheInvalidation, NodeCidrMasks, PendingUpdate, PoolMembership,
    UpdateTarget, VmSet, Zone,
};
use crate::backoff::{self, BackoffError};
use crate::cache::{ReadMode, TimedCache};
use crate::client::{ComputeClient, NetworkClient};
use crate::config::CloudConfig;
use crate::error::{aggregate, CloudError, Result};
use crate::ids;
use crate::model::{
    DataDisk, NetworkInterface, Node, ServiceRef, VirtualMachine, VmSetKind, VmUpdate,
    NIC_FAILED_STATE,
};
use crate::nodes::NodeProjection;

/// Lowercased computer names and VM names to VM documents.
type VmMap = HashMap<String, Arc<VirtualMachine>>;

fn forget_node(vms: &TimedCache<VmMap>, node_name: &str) {
    let node_name = node_name.to_lowercase();
    for key in vms.keys() {
        vms.modify(&key, |map| {
            let mut map = map.clone();
            let forgotten: Vec<String> = map
                .values()
                .filter(|vm| {
                    vm.name.eq_ignore_ascii_case(&node_name)
                        || vm
                            .computer_name
                            .as_deref()
                            .is_some_and(|n| n.eq_ignore_ascii_case(&node_name))
                })
                .flat_map(|vm| {
                    let mut keys = vec![vm.name.to_lowercase()];
                    keys.extend(vm.computer_name.as_deref().map(str::to_lowercase));
                    keys
                })
                .collect();
            for key in forgotten {
                map.remove(&key);
            }
            map
        });
    }
}

/// VM set name of a standalone VM, lowercased; empty if it belongs to none.
fn vm_set_name_of(vm: &VirtualMachine) -> String {
    vm.availability_set_id
        .as_deref()
        .or(vm.scale_set_id.as_deref())
        .and_then(|id| ids::last_segment(id, '/').ok())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

pub struct StandaloneVmSet {
    kind: VmSetKind,
    config: Arc<CloudConfig>,
    compute: Arc<dyn ComputeClient>,
    network: Arc<dyn NetworkClient>,
    projection: Arc<NodeProjection>,
    vms: Arc<TimedCache<VmMap>>,
}

impl StandaloneVmSet {
    /// Backend for `kind`, which must be an availability set or a flex scale set.
    pub fn new(
        kind: VmSetKind,
        config: Arc<CloudConfig>,
        compute: Arc<dyn ComputeClient>,
        network: Arc<dyn NetworkClient>,
        projection: Arc<NodeProjection>,
    ) -> Self {
        let ttl = match kind {
            VmSetKind::FlexScaleSet => config.non_uniform_nodes_cache_ttl(),
            _ => config.availability_set_nodes_cache_ttl(),
        };
        Self {
            kind,
            config,
            compute,
            network,
            projection,
            vms: Arc::new(TimedCache::new(ttl)),
        }
    }

    fn primary_vm_set_name(&self) -> &str {
        match self.kind {
            VmSetKind::FlexScaleSet => &self.config.primary_scale_set_name,
            _ => &self.config.primary_availability_set_name,
        }
    }

    fn owns(&self, vm: &VirtualMachine) -> bool {
        match self.kind {
            VmSetKind::FlexScaleSet => vm.scale_set_id.is_some(),
            _ => vm.scale_set_id.is_none(),
        }
    }

    async fn list(&self, resource_group: &str) -> Result<Option<VmMap>> {
        let vms = backoff::retry_notify(
            self.config.request_backoff(),
            move || async move {
                self.compute.list_vms(resource_group).await.map_err(|e| {
                    if e.is_not_found() {
                        BackoffError::permanent(e)
                    } else {
                        BackoffError::transient(e)
                    }
                })
            },
            |err: CloudError, delay: Duration| {
                warn!("listing VMs in {} failed, retrying in {:?}: {}", resource_group, delay, err);
            },
        )
        .await?;

        let mut map = VmMap::new();
        for vm in vms.into_iter().filter(|vm| self.owns(vm)) {
            let vm = Arc::new(vm);
            if let Some(computer_name) = vm.computer_name.as_deref() {
                map.insert(computer_name.to_lowercase(), vm.clone());
            }
            map.insert(vm.name.to_lowercase(), vm);
        }
        debug!(kind = %self.kind, resource_group, vms = map.len(), "refreshed standalone VM cache");
        Ok(Some(map))
    }

    async fn vm_map(&self, resource_group: &str, mode: ReadMode) -> Result<Arc<VmMap>> {
        self.vms
            .get(&resource_group.to_lowercase(), mode, |_| self.list(resource_group))
            .await?
            .ok_or_else(|| CloudError::unexpected(format!("VM cache for {resource_group} returned no data")))
    }

    /// VM of a node, refreshing its resource group's listing once on a miss.
    async fn vm_by_node(&self, node_name: &str, mode: ReadMode) -> Result<Arc<VirtualMachine>> {
        let resource_group = self.projection.node_resource_group(node_name).await?;
        let key = node_name.to_lowercase();

        if let Some(vm) = self.vm_map(&resource_group, mode).await?.get(&key) {
            return Ok(vm.clone());
        }
        if mode != ReadMode::ForceRefresh {
            info!("Couldn't find VM of node {}, refreshing the cache", node_name);
            if let Some(vm) = self
                .vm_map(&resource_group, ReadMode::ForceRefresh)
                .await?
                .get(&key)
            {
                return Ok(vm.clone());
            }
        }
        warn!("Unable to find node {}: instance not found", node_name);
        Err(CloudError::InstanceNotFound(node_name.to_string()))
    }

    /// VM by name within a resource group, falling back to a direct read.
    async fn vm_by_name(&self, resource_group: &str, vm_name: &str) -> Result<Arc<VirtualMachine>> {
        if let Some(vm) = self
            .vm_map(resource_group, ReadMode::Unsafe)
            .await?
            .get(&vm_name.to_lowercase())
        {
            return Ok(vm.clone());
        }
        match self.compute.get_vm(resource_group, vm_name).await {
            Ok(vm) => Ok(Arc::new(vm)),
            Err(e) if e.is_not_found() => Err(CloudError::InstanceNotFound(vm_name.to_string())),
            Err(e) => Err(e),
        }
    }

    fn resource_group_of(&self, vm: &VirtualMachine, fallback: &str) -> String {
        ids::resource_group_from_id(&vm.id).unwrap_or_else(|| fallback.to_string())
    }

    async fn primary_interface_of(&self, vm: &VirtualMachine) -> Result<NetworkInterface> {
        let nic_id = vm.primary_interface_id().ok_or_else(|| {
            CloudError::unexpected(format!("failed to find the primary nic of VM {}", vm.name))
        })?;
        let resource_group = ids::resource_group_from_id(nic_id)
            .unwrap_or_else(|| self.resource_group_of(vm, &self.config.resource_group));
        let nic_name = ids::last_segment(nic_id, '/')?;
        self.network.get_interface(&resource_group, nic_name).await
    }

    fn update_target(&self, vm: &VirtualMachine, node_resource_group: &str) -> UpdateTarget {
        UpdateTarget::Vm {
            resource_group: self.resource_group_of(vm, node_resource_group),
            name: vm.name.clone(),
        }
    }

    fn invalidation(&self, node_name: &str) -> CacheInvalidation {
        let vms = self.vms.clone();
        let node_name = node_name.to_string();
        CacheInvalidation::new(move || forget_node(&vms, &node_name))
    }

    async fn begin(&self, node_name: &str, disks: Option<Vec<DataDisk>>, vm: &VirtualMachine) -> Result<PendingUpdate> {
        let node_resource_group = self.projection.node_resource_group(node_name).await?;
        let target = self.update_target(vm, &node_resource_group);
        let invalidation = self.invalidation(node_name);

        let (completion, update) = match disks {
            Some(disks) => begin_storage_update(&*self.compute, &target, disks).await?,
            None => {
                let update = VmUpdate::default();
                (target.begin(&*self.compute, update.clone()).await?, update)
            }
        };
        Ok(PendingUpdate::new(
            node_name.to_lowercase(),
            target,
            update,
            self.compute.clone(),
            completion,
            invalidation,
        ))
    }
}

#[async_trait]
impl VmSet for StandaloneVmSet {
    fn kind(&self) -> VmSetKind {
        self.kind
    }

    async fn get_instance_id_by_node_name(&self, node_name: &str) -> Result<String> {
        let vm = self.vm_by_node(node_name, ReadMode::Unsafe).await?;
        ids::lowercase_resource_group(&vm.id)
    }

    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String> {
        let vm_name = ids::vm_name_from_provider_id(provider_id)?;
        let id = provider_id
            .strip_prefix(ids::PROVIDER_ID_PREFIX)
            .unwrap_or(provider_id);
        if let Some(resource_group) = ids::resource_group_from_id(id) {
            if let Some(vm) = self
                .vm_map(&resource_group, ReadMode::Unsafe)
                .await?
                .get(&vm_name)
            {
                if let Some(computer_name) = vm.computer_name.as_deref() {
                    return Ok(computer_name.to_lowercase());
                }
            }
        }
        Ok(vm_name)
    }

    async fn get_power_status(&self, node_name: &str) -> Result<String> {
        Ok(self.vm_by_node(node_name, ReadMode::Default).await?.power_state())
    }

    async fn get_provisioning_state(&self, node_name: &str) -> Result<String> {
        Ok(self
            .vm_by_node(node_name, ReadMode::Default)
            .await?
            .provisioning_state_or_unknown())
    }

    async fn get_zone_by_node_name(&self, node_name: &str) -> Result<Zone> {
        zone_of(&*self.vm_by_node(node_name, ReadMode::Unsafe).await?)
    }

    async fn get_ip_by_node_name(&self, node_name: &str) -> Result<(String, Option<String>)> {
        interface_ips(&self.get_primary_interface(node_name).await?)
    }

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface> {
        let vm = self.vm_by_node(node_name, ReadMode::Default).await?;
        self.primary_interface_of(&vm).await
    }

    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<NodeCidrMasks> {
        if self.kind != VmSetKind::FlexScaleSet {
            return Ok(NodeCidrMasks::default());
        }
        let node_name = self.get_node_name_by_provider_id(provider_id).await?;
        let vm = self.vm_by_node(&node_name, ReadMode::Unsafe).await?;
        let Some(scale_set_id) = vm.scale_set_id.as_deref() else {
            return Ok(NodeCidrMasks::default());
        };
        let resource_group = ids::resource_group_from_id(scale_set_id)
            .unwrap_or_else(|| self.config.resource_group.clone());
        let scale_set = self
            .compute
            .get_scale_set(&resource_group, ids::last_segment(scale_set_id, '/')?)
            .await?;
        Ok(NodeCidrMasks::from_tags(&scale_set.tags))
    }

    async fn get_agent_pool_vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for node in nodes.iter().filter(|n| !n.is_control_plane()) {
            let vm = self.vm_by_node(&node.name, ReadMode::Unsafe).await?;
            let name = vm_set_name_of(&vm);
            if !name.is_empty() {
                names.insert(name);
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String> {
        Ok(vm_set_name_of(&*self.vm_by_node(&node.name, ReadMode::Unsafe).await?))
    }

    async fn get_vm_set_names(&self, service: &ServiceRef, nodes: &[Node]) -> Result<Vec<String>> {
        let agent_pools = if service.load_balancer_mode.is_some()
            && !self.config.use_single_standard_load_balancer()
        {
            self.get_agent_pool_vm_set_names(nodes).await?
        } else {
            Vec::new()
        };
        select_vm_set_names(&self.config, service, self.primary_vm_set_name(), agent_pools)
    }

    async fn get_node_name_by_ip_configuration_id(&self, ip_config_id: &str) -> Result<(String, String)> {
        let (resource_group, nic_name) = ids::parse_nic_ip_config_id(ip_config_id).ok_or_else(|| {
            CloudError::unexpected(format!(
                "can not extract nic name from ip configuration id {ip_config_id}"
            ))
        })?;
        let nic = self.network.get_interface(&resource_group, &nic_name).await?;
        let vm_id = nic.virtual_machine_id.as_deref().unwrap_or_default();
        if vm_id.is_empty() {
            debug!("nic {} is not attached to a VM", nic_name);
            return Ok((String::new(), String::new()));
        }

        let vm_resource_group = ids::resource_group_from_id(vm_id).unwrap_or(resource_group);
        let vm = self
            .vm_by_name(&vm_resource_group, ids::last_segment(vm_id, '/')?)
            .await?;
        let node_name = vm
            .computer_name
            .as_deref()
            .unwrap_or(&vm.name)
            .to_lowercase();
        Ok((node_name, vm_set_name_of(&vm)))
    }

    async fn ensure_host_in_pool(
        &self,
        service: &ServiceRef,
        node: &Node,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<PoolMembership> {
        let vm = match self.vm_by_node(&node.name, ReadMode::Default).await {
            Ok(vm) => vm,
            Err(e) if e.is_instance_not_found() => {
                info!("EnsureHostInPool: skipping node {} because it is not found", node.name);
                return Ok(PoolMembership::Unchanged);
            }
            Err(e) => return Err(e),
        };

        let node_vm_set = vm_set_name_of(&vm);
        if !node_in_vm_set(&self.config, vm_set_name, &node_vm_set) {
            debug!(
                "EnsureHostInPool: node {} in vm set {} does not belong to {}, skipping",
                node.name, node_vm_set, vm_set_name
            );
            return Ok(PoolMembership::Unchanged);
        }

        let mut nic = self.primary_interface_of(&vm).await?;
        if nic.provisioning_state.as_deref() == Some(NIC_FAILED_STATE) {
            warn!(
                "EnsureHostInPool skips node {} because its primary nic {} is in Failed state",
                node.name, nic.name
            );
            return Ok(PoolMembership::Unchanged);
        }

        let nic_name = nic.name.clone();
        let ip_configuration = select_ip_configuration(
            &mut nic.ip_configurations,
            service.ipv6,
            self.config.ipv6_dual_stack_enabled,
            &nic_name,
        )?;
        if !add_backend_pool(
            ip_configuration,
            backend_pool_id,
            self.config.use_standard_load_balancer(),
            &node.name,
        )? {
            return Ok(PoolMembership::Unchanged);
        }

        let resource_group = ids::resource_group_from_id(&nic.id)
            .unwrap_or_else(|| self.resource_group_of(&vm, &self.config.resource_group));
        info!(
            "EnsureHostInPool: adding nic {} of node {} to backend pool {}",
            nic_name, node.name, backend_pool_id
        );
        self.network
            .create_or_update_interface(&resource_group, &nic_name, nic)
            .await?;
        Ok(PoolMembership::Applied)
    }

    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let mut hosts = Vec::with_capacity(nodes.len());
        for node in nodes {
            if self.config.use_standard_load_balancer()
                && self.config.exclude_master_nodes_from_standard_lb()
                && node.is_control_plane()
            {
                debug!("EnsureHostsInPool: skipping control plane node {}", node.name);
                continue;
            }
            if self.projection.should_exclude_from_load_balancer(&node.name).await? {
                debug!("EnsureHostsInPool: node {} is excluded from load balancers", node.name);
                continue;
            }
            hosts.push(self.ensure_host_in_pool(service, node, backend_pool_id, vm_set_name));
        }

        let errors = join_all(hosts)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        aggregate(errors)
    }

    async fn ensure_backend_pool_deleted(
        &self,
        _service: &ServiceRef,
        backend_pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
        _delete_from_vm_set: bool,
    ) -> Result<bool> {
        let mut nics: BTreeMap<(String, String), NetworkInterface> = BTreeMap::new();

        for ip_config_id in ip_configuration_ids {
            let (node_name, node_vm_set) = match self.get_node_name_by_ip_configuration_id(ip_config_id).await {
                Ok(found) => found,
                Err(e) if e.is_instance_not_found() || e.is_not_found() => {
                    debug!("ip configuration {} has no VM: {}", ip_config_id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if node_name.is_empty() {
                continue;
            }
            if !node_in_vm_set(&self.config, vm_set_name, &node_vm_set) {
                debug!(
                    "EnsureBackendPoolDeleted: node {} is not in vm set {}, skipping",
                    node_name, vm_set_name
                );
                continue;
            }

            let Some((resource_group, nic_name)) = ids::parse_nic_ip_config_id(ip_config_id) else {
                continue;
            };
            let key = (resource_group.to_lowercase(), nic_name.to_lowercase());
            if nics.contains_key(&key) {
                continue;
            }
            let mut nic = self.network.get_interface(&resource_group, &nic_name).await?;
            if nic.provisioning_state.as_deref() == Some(NIC_FAILED_STATE) {
                warn!(
                    "EnsureBackendPoolDeleted skips node {} because its nic {} is in Failed state",
                    node_name, nic_name
                );
                continue;
            }
            if remove_backend_pool(&mut nic.ip_configurations, backend_pool_id) {
                nics.insert(key, nic);
            }
        }

        if nics.is_empty() {
            return Ok(false);
        }

        let updates = nics.into_iter().map(|((resource_group, _), nic)| {
            let network = self.network.clone();
            async move {
                info!("EnsureBackendPoolDeleted: removing backend pool {} from nic {}", backend_pool_id, nic.name);
                let name = nic.name.clone();
                network.create_or_update_interface(&resource_group, &name, nic).await
            }
        });
        let errors = join_all(updates)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        aggregate(errors)?;
        Ok(true)
    }

    async fn get_data_disks(
        &self,
        node_name: &str,
        mode: ReadMode,
    ) -> Result<(Vec<DataDisk>, Option<String>)> {
        let vm = self.vm_by_node(node_name, mode).await?;
        Ok((filter_detaching(&vm.data_disks), vm.provisioning_state.clone()))
    }

    async fn attach_disk(
        &self,
        node_name: &str,
        disks: &BTreeMap<String, AttachOptions>,
    ) -> Result<PendingUpdate> {
        let vm = self.vm_by_node(node_name, ReadMode::Default).await?;
        let data_disks = with_attached_disks(node_name, &vm.data_disks, disks)?;
        info!(
            "azureDisk - update(attach): vm({}) node({}) disks({:?})",
            vm.name,
            node_name,
            disks.keys().collect::<Vec<_>>()
        );
        self.begin(node_name, Some(data_disks), &vm).await
    }

    async fn detach_disk(&self, node_name: &str, disks: &BTreeMap<String, String>) -> Result<PendingUpdate> {
        let vm = self.vm_by_node(node_name, ReadMode::Default).await?;
        let data_disks = with_detached_disks(node_name, &vm.data_disks, disks, self.config.is_stack_cloud());
        info!(
            "azureDisk - update(detach): vm({}) node({}) disks({:?})",
            vm.name, node_name, disks
        );
        self.begin(node_name, Some(data_disks), &vm).await
    }

    async fn update_vm(&self, node_name: &str) -> Result<PendingUpdate> {
        let vm = self.vm_by_node(node_name, ReadMode::Default).await?;
        self.begin(node_name, None, &vm).await
    }

    fn delete_cache_for_node(&self, node_name: &str) {
        forget_node(&self.vms, node_name);
    }
}
