//! Uniform scale-set backend.
//!
//! Serves uniform scale-set instances from the scale-set registry and the
//! instance cache. Nodes the dispatcher classifies as availability-set or flex
//! members are handed to the matching [`StandaloneVmSet`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::{
    add_backend_pool, begin_storage_update, filter_detaching, interface_ips, node_in_vm_set,
    primary_nic_configuration, remove_backend_pool, select_ip_configuration, select_vm_set_names,
    with_attached_disks, with_detached_disks, zone_of, AttachOptions, CacheInvalidation,
    NodeCidrMasks, PendingUpdate, PoolMembership, StagedUpdate, StandaloneVmSet, UpdateTarget,
    VmSet, Zone,
};
use crate::cache::ReadMode;
use crate::client::{ComputeClient, NetworkClient};
use crate::config::CloudConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{aggregate, CloudError, Result};
use crate::ids;
use crate::instances::InstanceCache;
use crate::model::{
    DataDisk, NetworkInterface, Node, ServiceRef, VirtualMachine, VmSetKind, VmUpdate,
};
use crate::nodes::NodeProjection;
use crate::registry::{NodeIdentity, ScaleSetRegistry};

pub struct UniformVmSet {
    config: Arc<CloudConfig>,
    compute: Arc<dyn ComputeClient>,
    network: Arc<dyn NetworkClient>,
    projection: Arc<NodeProjection>,
    registry: Arc<ScaleSetRegistry>,
    instances: Arc<InstanceCache>,
    dispatcher: Arc<Dispatcher>,
    availability_set: StandaloneVmSet,
    flex: StandaloneVmSet,
}

impl UniformVmSet {
    pub fn new(
        config: Arc<CloudConfig>,
        compute: Arc<dyn ComputeClient>,
        network: Arc<dyn NetworkClient>,
        projection: Arc<NodeProjection>,
    ) -> Self {
        let instances = Arc::new(InstanceCache::new(compute.clone(), config.instance_cache_ttl()));
        let registry = Arc::new(ScaleSetRegistry::new(
            compute.clone(),
            projection.clone(),
            instances.clone(),
            config.scale_set_cache_ttl(),
            config.put_vmss_vm_batch_size,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            compute.clone(),
            projection.clone(),
            instances.clone(),
            config.non_uniform_nodes_cache_ttl(),
            config.disable_availability_set_nodes,
            config.enable_vmss_flex_nodes,
        ));
        let availability_set = StandaloneVmSet::new(
            VmSetKind::AvailabilitySet,
            config.clone(),
            compute.clone(),
            network.clone(),
            projection.clone(),
        );
        let flex = StandaloneVmSet::new(
            VmSetKind::FlexScaleSet,
            config.clone(),
            compute.clone(),
            network.clone(),
            projection.clone(),
        );

        Self {
            config,
            compute,
            network,
            projection,
            registry,
            instances,
            dispatcher,
            availability_set,
            flex,
        }
    }

    pub fn registry(&self) -> &Arc<ScaleSetRegistry> {
        &self.registry
    }

    pub fn instances(&self) -> &Arc<InstanceCache> {
        &self.instances
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn standalone(&self, kind: VmSetKind) -> Option<&StandaloneVmSet> {
        match kind {
            VmSetKind::AvailabilitySet => Some(&self.availability_set),
            VmSetKind::FlexScaleSet => Some(&self.flex),
            _ => None,
        }
    }

    /// The standalone backend owning a node, or `None` for uniform instances.
    async fn standalone_for(&self, node_name: &str, mode: ReadMode) -> Result<Option<&StandaloneVmSet>> {
        match self.dispatcher.classify_by_node_name(node_name, mode).await? {
            VmSetKind::UniformScaleSet => Ok(None),
            VmSetKind::Unknown => Err(CloudError::InstanceNotFound(node_name.to_string())),
            kind => Ok(self.standalone(kind)),
        }
    }

    async fn uniform_vm(&self, node_name: &str, mode: ReadMode) -> Result<(NodeIdentity, Arc<VirtualMachine>)> {
        let identity = self.registry.node_identity(node_name, mode).await?;
        let vm = self
            .instances
            .get_by_node_name(&identity.resource_group, &identity.scale_set, &identity.node_name, mode)
            .await?;
        Ok((identity, vm))
    }

    fn update_target(identity: &NodeIdentity, vm: &VirtualMachine) -> Result<UpdateTarget> {
        let instance_id = vm.instance_id.clone().ok_or_else(|| {
            CloudError::unexpected(format!("instance of node {} has no instance id", identity.node_name))
        })?;
        Ok(UpdateTarget::ScaleSetVm {
            resource_group: identity.resource_group.clone(),
            scale_set: identity.scale_set.clone(),
            instance_id,
        })
    }

    fn invalidation(&self, resource_group: &str, scale_set: &str, node_name: &str) -> CacheInvalidation {
        let instances = self.instances.clone();
        let (resource_group, scale_set, node_name) =
            (resource_group.to_string(), scale_set.to_string(), node_name.to_string());
        CacheInvalidation::new(move || instances.delete_node(&resource_group, &scale_set, &node_name))
    }

    async fn begin(
        &self,
        identity: NodeIdentity,
        vm: &VirtualMachine,
        disks: Option<Vec<DataDisk>>,
    ) -> Result<PendingUpdate> {
        let target = Self::update_target(&identity, vm)?;
        let invalidation = self.invalidation(&identity.resource_group, &identity.scale_set, &identity.node_name);

        let (completion, update) = match disks {
            Some(disks) => begin_storage_update(&*self.compute, &target, disks).await?,
            None => {
                let update = VmUpdate::default();
                (target.begin(&*self.compute, update.clone()).await?, update)
            }
        };
        Ok(PendingUpdate::new(
            identity.node_name,
            target,
            update,
            self.compute.clone(),
            completion,
            invalidation,
        ))
    }

    // =========================================================================
    // Backend pools
    // =========================================================================

    async fn uniform_host_in_pool(
        &self,
        service: &ServiceRef,
        node: &Node,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<PoolMembership> {
        let (identity, vm) = match self.uniform_vm(&node.name, ReadMode::Default).await {
            Ok(found) => found,
            Err(e) if e.is_instance_not_found() => {
                info!("EnsureHostInPool: skipping node {} because it is not found", node.name);
                return Ok(PoolMembership::Unchanged);
            }
            Err(e) => return Err(e),
        };

        if !node_in_vm_set(&self.config, vm_set_name, &identity.scale_set) {
            debug!(
                "EnsureHostInPool: node {} in scale set {} does not belong to {}, skipping",
                node.name, identity.scale_set, vm_set_name
            );
            return Ok(PoolMembership::Unchanged);
        }

        let mut configurations = vm.nic_configurations().to_vec();
        if configurations.is_empty() {
            info!(
                "EnsureHostInPool: cannot obtain the primary network interface configuration of node {}",
                node.name
            );
            return Ok(PoolMembership::Unchanged);
        }
        let nic = primary_nic_configuration(&mut configurations, &node.name)?;
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

        let instance_id = vm.instance_id.clone().ok_or_else(|| {
            CloudError::unexpected(format!("instance of node {} has no instance id", node.name))
        })?;
        Ok(PoolMembership::Staged(StagedUpdate {
            node_name: identity.node_name,
            resource_group: identity.resource_group,
            scale_set: identity.scale_set,
            instance_id,
            update: VmUpdate::network(configurations),
        }))
    }

    async fn apply_staged(&self, staged: StagedUpdate, source: &'static str) -> Result<()> {
        let target = UpdateTarget::ScaleSetVm {
            resource_group: staged.resource_group.clone(),
            scale_set: staged.scale_set.clone(),
            instance_id: staged.instance_id.clone(),
        };
        let invalidation = self.invalidation(&staged.resource_group, &staged.scale_set, &staged.node_name);
        let completion = match target.begin(&*self.compute, staged.update.clone()).await {
            Ok(completion) => completion,
            Err(e) if e.is_instance_not_found() => {
                info!("{}: instance {} is gone, skipping", source, target);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        PendingUpdate::new(
            staged.node_name,
            target,
            staged.update,
            self.compute.clone(),
            completion,
            invalidation,
        )
        .wait(source)
        .await
    }

    /// Apply staged instance updates of one scale set, at most `batch size`
    /// at a time.
    async fn flush_staged(&self, scale_set: &str, updates: Vec<StagedUpdate>, source: &'static str) -> Result<()> {
        let batch_size = match self.registry.batch_size(scale_set).await {
            Ok(size) => size,
            Err(e) => {
                warn!("failed to get batch size of scale set {}, updating serially: {}", scale_set, e);
                0
            }
        };
        debug!(scale_set, batch_size, updates = updates.len(), "{}: flushing instance updates", source);

        let errors: Vec<CloudError> = stream::iter(updates)
            .map(|staged| self.apply_staged(staged, source))
            .buffer_unordered(batch_size.max(1))
            .filter_map(|r| async move { r.err() })
            .collect()
            .await;
        aggregate(errors)
    }

    async fn flush_all(
        &self,
        staged: BTreeMap<(String, String), Vec<StagedUpdate>>,
        source: &'static str,
    ) -> Vec<CloudError> {
        let mut errors = Vec::new();
        for ((_, scale_set), updates) in staged {
            if let Err(e) = self.flush_staged(&scale_set, updates, source).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Add the pool to the scale sets' VM templates so new instances join it.
    async fn ensure_scale_sets_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let mut names = BTreeSet::new();
        if self.config.use_single_standard_load_balancer() {
            for node in nodes {
                if self.config.exclude_master_nodes_from_standard_lb() && node.is_control_plane() {
                    continue;
                }
                if self.projection.should_exclude_from_load_balancer(&node.name).await? {
                    continue;
                }
                let Some(provider_id) = node.provider_id.as_deref() else {
                    continue;
                };
                match ids::scale_set_and_resource_group_from_vm_id(provider_id) {
                    Ok((scale_set, resource_group)) => {
                        if resource_group.eq_ignore_ascii_case(&self.config.resource_group) {
                            names.insert(scale_set);
                        }
                    }
                    Err(_) => {
                        debug!("ensureScaleSetsInPool: node {} is not a uniform instance, skipping", node.name);
                    }
                }
            }
        } else if !vm_set_name.is_empty() {
            names.insert(vm_set_name.to_string());
        }

        let mut changed = false;
        for name in names {
            let entry = match self.registry.get(&name, ReadMode::Default).await {
                Ok(entry) => entry,
                Err(e) if e.is_instance_not_found() => {
                    debug!("ensureScaleSetsInPool: {} is not a uniform scale set, skipping", name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if entry.scale_set.is_deallocating() {
                info!("ensureScaleSetsInPool: scale set {} is being deallocated, skipping", name);
                continue;
            }

            let mut scale_set = entry.scale_set.clone();
            let Some(profile) = scale_set.vm_profile.as_mut() else {
                continue;
            };
            if profile.network_configurations.is_empty() {
                continue;
            }
            let nic = primary_nic_configuration(&mut profile.network_configurations, &name)?;
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
                &name,
            )? {
                continue;
            }

            info!("ensureScaleSetsInPool: adding backend pool {} to scale set {}", backend_pool_id, name);
            let scale_set_name = scale_set.name.clone();
            self.compute
                .create_or_update_scale_set(&entry.resource_group, &scale_set_name, scale_set)
                .await?;
            changed = true;
        }

        if changed {
            self.registry.invalidate();
        }
        Ok(())
    }

    /// Remove the pool from scale-set VM templates. Returns true if any changed.
    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        names: &BTreeSet<String>,
        backend_pool_id: &str,
    ) -> Result<bool> {
        let updates = names.iter().map(|name| async move {
            let entry = match self.registry.get(name, ReadMode::Default).await {
                Ok(entry) => entry,
                Err(e) if e.is_instance_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            if entry.scale_set.is_deallocating() {
                info!("scale set {} is being deallocated, skipping", name);
                return Ok(false);
            }

            let mut scale_set = entry.scale_set.clone();
            let Some(profile) = scale_set.vm_profile.as_mut() else {
                return Ok(false);
            };
            if profile.network_configurations.is_empty() {
                return Ok(false);
            }
            let nic = primary_nic_configuration(&mut profile.network_configurations, name)?;
            if !remove_backend_pool(&mut nic.ip_configurations, backend_pool_id) {
                return Ok(false);
            }

            info!("removing backend pool {} from scale set {}", backend_pool_id, name);
            let scale_set_name = scale_set.name.clone();
            self.compute
                .create_or_update_scale_set(&entry.resource_group, &scale_set_name, scale_set)
                .await?;
            Ok::<_, CloudError>(true)
        });

        let mut changed = false;
        let mut errors = Vec::new();
        for result in join_all(updates).await {
            match result {
                Ok(updated) => changed |= updated,
                Err(e) => errors.push(e),
            }
        }
        if changed {
            self.registry.invalidate();
        }
        aggregate(errors)?;
        Ok(changed)
    }

    /// Staged update removing the pool from an instance's primary NIC.
    async fn uniform_pool_removal(
        &self,
        ip_config: &ids::ScaleSetIpConfig,
        backend_pool_id: &str,
    ) -> Result<Option<StagedUpdate>> {
        let vm = match self
            .instances
            .get_by_instance_id(
                &ip_config.resource_group,
                &ip_config.scale_set,
                &ip_config.instance_id,
                ReadMode::Default,
            )
            .await
        {
            Ok(vm) => vm,
            Err(e) if e.is_instance_not_found() => {
                info!(
                    "EnsureBackendPoolDeleted: instance {} of scale set {} is not found, skipping",
                    ip_config.instance_id, ip_config.scale_set
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut configurations = vm.nic_configurations().to_vec();
        if configurations.is_empty() {
            return Ok(None);
        }
        let node_name = vm
            .computer_name
            .as_deref()
            .unwrap_or(&vm.name)
            .to_lowercase();
        let nic = primary_nic_configuration(&mut configurations, &node_name)?;
        if !remove_backend_pool(&mut nic.ip_configurations, backend_pool_id) {
            return Ok(None);
        }
        Ok(Some(StagedUpdate {
            node_name,
            resource_group: ip_config.resource_group.clone(),
            scale_set: ip_config.scale_set.clone(),
            instance_id: ip_config.instance_id.clone(),
            update: VmUpdate::network(configurations),
        }))
    }
}

#[async_trait]
impl VmSet for UniformVmSet {
    fn kind(&self) -> VmSetKind {
        VmSetKind::UniformScaleSet
    }

    async fn get_instance_id_by_node_name(&self, node_name: &str) -> Result<String> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_instance_id_by_node_name(node_name).await;
        }
        let (_, vm) = self.uniform_vm(node_name, ReadMode::Unsafe).await?;
        ids::lowercase_resource_group(&vm.id)
    }

    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String> {
        match self.dispatcher.classify_by_provider_id(provider_id, ReadMode::Unsafe).await? {
            VmSetKind::UniformScaleSet => {}
            VmSetKind::Unknown => {
                return Err(CloudError::InstanceNotFound(format!(
                    "no VM set owns provider id {provider_id}"
                )));
            }
            kind => {
                if let Some(backend) = self.standalone(kind) {
                    return backend.get_node_name_by_provider_id(provider_id).await;
                }
            }
        }

        let scale_set = ids::scale_set_name_from_id(provider_id)?;
        let resource_group = ids::scale_set_resource_group_from_id(provider_id)?;
        let mut instance_id = ids::last_segment(provider_id, '/')?;
        // Disk owners report instances as `<scale set>_<instance id>`.
        if instance_id
            .to_lowercase()
            .starts_with(&scale_set.to_lowercase())
        {
            instance_id = ids::last_segment(instance_id, '_')?;
        }

        let vm = self
            .instances
            .get_by_instance_id(&resource_group, &scale_set, instance_id, ReadMode::Unsafe)
            .await?;
        vm.computer_name
            .as_deref()
            .map(str::to_lowercase)
            .ok_or_else(|| {
                CloudError::unexpected(format!("instance {provider_id} has no computer name"))
            })
    }

    async fn get_power_status(&self, node_name: &str) -> Result<String> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_power_status(node_name).await;
        }
        let (_, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        Ok(vm.power_state())
    }

    async fn get_provisioning_state(&self, node_name: &str) -> Result<String> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_provisioning_state(node_name).await;
        }
        let (_, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        Ok(vm.provisioning_state_or_unknown())
    }

    async fn get_zone_by_node_name(&self, node_name: &str) -> Result<Zone> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_zone_by_node_name(node_name).await;
        }
        let (_, vm) = self.uniform_vm(node_name, ReadMode::Unsafe).await?;
        zone_of(&vm).inspect_err(|_| self.instances.forget_node(node_name))
    }

    async fn get_ip_by_node_name(&self, node_name: &str) -> Result<(String, Option<String>)> {
        interface_ips(&self.get_primary_interface(node_name).await?)
    }

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_primary_interface(node_name).await;
        }
        let (identity, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        let nic_id = vm.primary_interface_id().ok_or_else(|| {
            CloudError::unexpected(format!("failed to find the primary nic of node {node_name}"))
        })?;
        let nic_name = ids::last_segment(nic_id, '/')?;
        let instance_id = vm.instance_id.as_deref().unwrap_or_default();
        self.network
            .get_scale_set_interface(&identity.resource_group, &identity.scale_set, instance_id, nic_name)
            .await
    }

    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<NodeCidrMasks> {
        let kind = self
            .dispatcher
            .classify_by_provider_id(provider_id, ReadMode::Unsafe)
            .await?;
        if let Some(backend) = self.standalone(kind) {
            return backend.get_node_cidr_masks_by_provider_id(provider_id).await;
        }
        let scale_set = ids::scale_set_name_from_id(provider_id)?;
        let entry = self.registry.get(&scale_set, ReadMode::Default).await?;
        Ok(NodeCidrMasks::from_tags(&entry.scale_set.tags))
    }

    async fn get_agent_pool_vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for node in nodes.iter().filter(|n| !n.is_control_plane()) {
            let name = self.get_node_vm_set_name(node).await?;
            if !name.is_empty() {
                names.insert(name);
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String> {
        if let Some(backend) = self.standalone_for(&node.name, ReadMode::Unsafe).await? {
            return backend.get_node_vm_set_name(node).await;
        }
        let identity = self.registry.node_identity(&node.name, ReadMode::Unsafe).await?;
        Ok(identity.scale_set.to_lowercase())
    }

    async fn get_vm_set_names(&self, service: &ServiceRef, nodes: &[Node]) -> Result<Vec<String>> {
        let agent_pools = if service.load_balancer_mode.is_some()
            && !self.config.use_single_standard_load_balancer()
        {
            self.get_agent_pool_vm_set_names(nodes).await?
        } else {
            Vec::new()
        };
        select_vm_set_names(&self.config, service, &self.config.primary_scale_set_name, agent_pools)
    }

    async fn get_node_name_by_ip_configuration_id(&self, ip_config_id: &str) -> Result<(String, String)> {
        let kind = self.dispatcher.classify_by_ip_config_id(ip_config_id).await?;
        if let Some(backend) = self.standalone(kind) {
            return backend.get_node_name_by_ip_configuration_id(ip_config_id).await;
        }

        let ip_config = ids::parse_scale_set_ip_config_id(ip_config_id).ok_or_else(|| {
            CloudError::unexpected(format!(
                "can not extract scale set name from ip configuration id {ip_config_id}"
            ))
        })?;
        let vm = self
            .instances
            .get_by_instance_id(
                &ip_config.resource_group,
                &ip_config.scale_set,
                &ip_config.instance_id,
                ReadMode::Unsafe,
            )
            .await?;
        let node_name = vm
            .computer_name
            .as_deref()
            .map(str::to_lowercase)
            .ok_or_else(|| CloudError::unexpected(format!("instance of {ip_config_id} has no computer name")))?;
        Ok((node_name, ip_config.scale_set.to_lowercase()))
    }

    async fn ensure_host_in_pool(
        &self,
        service: &ServiceRef,
        node: &Node,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<PoolMembership> {
        if let Some(backend) = self.standalone_for(&node.name, ReadMode::Default).await? {
            return backend
                .ensure_host_in_pool(service, node, backend_pool_id, vm_set_name)
                .await;
        }
        self.uniform_host_in_pool(service, node, backend_pool_id, vm_set_name)
            .await
    }

    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let mut standalone_hosts = Vec::new();
        let mut staged: BTreeMap<(String, String), Vec<StagedUpdate>> = BTreeMap::new();
        let mut errors = Vec::new();

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

            match self.standalone_for(&node.name, ReadMode::Default).await {
                Ok(Some(backend)) => {
                    // Standalone VMs only join standard load balancers here.
                    if self.config.use_standard_load_balancer() {
                        standalone_hosts.push(backend.ensure_host_in_pool(
                            service,
                            node,
                            backend_pool_id,
                            vm_set_name,
                        ));
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_instance_not_found() => {
                    info!("EnsureHostsInPool: skipping unknown node {}", node.name);
                    continue;
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            }

            match self
                .uniform_host_in_pool(service, node, backend_pool_id, vm_set_name)
                .await
            {
                Ok(PoolMembership::Staged(update)) => staged
                    .entry((update.resource_group.to_lowercase(), update.scale_set.to_lowercase()))
                    .or_default()
                    .push(update),
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
        }

        for result in join_all(standalone_hosts).await {
            if let Err(e) = result {
                errors.push(e);
            }
        }
        errors.extend(self.flush_all(staged, "EnsureHostInPool").await);
        aggregate(errors)?;

        self.ensure_scale_sets_in_pool(service, nodes, backend_pool_id, vm_set_name)
            .await
    }

    async fn ensure_backend_pool_deleted(
        &self,
        service: &ServiceRef,
        backend_pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
        delete_from_vm_set: bool,
    ) -> Result<bool> {
        let mut errors = Vec::new();
        let mut availability_set_ids = Vec::new();
        let mut flex_ids = Vec::new();
        let mut removals: BTreeMap<(String, String, String), ids::ScaleSetIpConfig> = BTreeMap::new();
        let mut scale_sets = BTreeSet::new();

        for ip_config_id in ip_configuration_ids {
            let kind = match self.dispatcher.classify_by_ip_config_id(ip_config_id).await {
                Ok(kind) => kind,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            match kind {
                VmSetKind::AvailabilitySet => availability_set_ids.push(ip_config_id.clone()),
                VmSetKind::FlexScaleSet => flex_ids.push(ip_config_id.clone()),
                VmSetKind::Unknown => {}
                VmSetKind::UniformScaleSet => {
                    let Some(ip_config) = ids::parse_scale_set_ip_config_id(ip_config_id) else {
                        debug!("{} is not a scale set ip configuration, skipping", ip_config_id);
                        continue;
                    };
                    // Basic load balancers only drop members of their own scale set.
                    if !self.config.use_standard_load_balancer()
                        && !ip_config.scale_set.eq_ignore_ascii_case(vm_set_name)
                    {
                        continue;
                    }
                    scale_sets.insert(ip_config.scale_set.to_lowercase());
                    removals.insert(
                        (
                            ip_config.resource_group.to_lowercase(),
                            ip_config.scale_set.to_lowercase(),
                            ip_config.instance_id.clone(),
                        ),
                        ip_config,
                    );
                }
            }
        }

        let mut staged: BTreeMap<(String, String), Vec<StagedUpdate>> = BTreeMap::new();
        for ((resource_group, scale_set, _), ip_config) in removals {
            match self.uniform_pool_removal(&ip_config, backend_pool_id).await {
                Ok(Some(update)) => staged.entry((resource_group, scale_set)).or_default().push(update),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        let mut changed = !staged.is_empty();
        errors.extend(self.flush_all(staged, "EnsureBackendPoolDeleted").await);

        for (backend, backend_ids) in [
            (&self.availability_set, availability_set_ids),
            (&self.flex, flex_ids),
        ] {
            if backend_ids.is_empty() {
                continue;
            }
            match backend
                .ensure_backend_pool_deleted(service, backend_pool_id, vm_set_name, &backend_ids, false)
                .await
            {
                Ok(updated) => changed |= updated,
                Err(e) => errors.push(e),
            }
        }

        if delete_from_vm_set {
            if self.config.use_standard_load_balancer() {
                match self.registry.all(ReadMode::Default).await {
                    Ok(entries) => {
                        scale_sets.extend(entries.into_iter().map(|e| e.scale_set.name.to_lowercase()))
                    }
                    Err(e) => errors.push(e),
                }
            } else if !vm_set_name.is_empty() {
                scale_sets.insert(vm_set_name.to_lowercase());
            }
            match self
                .ensure_backend_pool_deleted_from_vm_sets(&scale_sets, backend_pool_id)
                .await
            {
                Ok(updated) => changed |= updated,
                Err(e) => errors.push(e),
            }
        }

        aggregate(errors)?;
        Ok(changed)
    }

    async fn get_data_disks(
        &self,
        node_name: &str,
        mode: ReadMode,
    ) -> Result<(Vec<DataDisk>, Option<String>)> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.get_data_disks(node_name, mode).await;
        }
        let (_, vm) = self.uniform_vm(node_name, mode).await?;
        Ok((filter_detaching(&vm.data_disks), vm.provisioning_state.clone()))
    }

    async fn attach_disk(
        &self,
        node_name: &str,
        disks: &BTreeMap<String, AttachOptions>,
    ) -> Result<PendingUpdate> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.attach_disk(node_name, disks).await;
        }
        let (identity, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        let data_disks = with_attached_disks(node_name, &vm.data_disks, disks)?;
        info!(
            "azureDisk - update(attach): scale set instance({}) disks({:?})",
            node_name,
            disks.keys().collect::<Vec<_>>()
        );
        self.begin(identity, &vm, Some(data_disks)).await
    }

    async fn detach_disk(&self, node_name: &str, disks: &BTreeMap<String, String>) -> Result<PendingUpdate> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.detach_disk(node_name, disks).await;
        }
        let (identity, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        let data_disks = with_detached_disks(node_name, &vm.data_disks, disks, self.config.is_stack_cloud());
        info!("azureDisk - update(detach): scale set instance({}) disks({:?})", node_name, disks);
        self.begin(identity, &vm, Some(data_disks)).await
    }

    async fn update_vm(&self, node_name: &str) -> Result<PendingUpdate> {
        if let Some(backend) = self.standalone_for(node_name, ReadMode::Unsafe).await? {
            return backend.update_vm(node_name).await;
        }
        let (identity, vm) = self.uniform_vm(node_name, ReadMode::Default).await?;
        self.begin(identity, &vm, None).await
    }

    fn delete_cache_for_node(&self, node_name: &str) {
        self.instances.forget_node(node_name);
        self.availability_set.delete_cache_for_node(node_name);
        self.flex.delete_cache_for_node(node_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancerSku, VmType};
    use crate::memory::MemoryCloud;
    use crate::model::{
        InstanceView, InterfaceReference, IpConfiguration, NetworkProfile, NicConfiguration,
        OrchestrationMode, ScaleSet, ScaleSetVmProfile, TAG_BATCH_OPERATION, TAG_CIDR_MASK_IPV4,
    };

    const SUB: &str = "/subscriptions/sub/resourceGroups/rg/providers";

    fn make_nic_config() -> NicConfiguration {
        NicConfiguration {
            name: "pool-nic".into(),
            primary: Some(true),
            ip_configurations: vec![IpConfiguration {
                name: "ipconfig1".into(),
                primary: Some(true),
                ..Default::default()
            }],
        }
    }

    fn instance_id(iid: u32) -> String {
        format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/pool/virtualMachines/{iid}")
    }

    fn ip_config_id(iid: u32) -> String {
        format!("{}/networkInterfaces/pool-nic/ipConfigurations/ipconfig1", instance_id(iid))
    }

    fn make_instance(iid: u32) -> VirtualMachine {
        VirtualMachine {
            id: instance_id(iid),
            name: format!("pool_{iid}"),
            location: "westus".into(),
            instance_id: Some(iid.to_string()),
            computer_name: Some(format!("aks-pool-{iid:06}")),
            network_profile: Some(NetworkProfile {
                interfaces: vec![InterfaceReference {
                    id: format!("{}/networkInterfaces/pool-nic", instance_id(iid)),
                    primary: Some(true),
                }],
                configurations: vec![make_nic_config()],
            }),
            instance_view: Some(InstanceView {
                statuses: vec!["PowerState/running".into()],
                platform_fault_domain: None,
            }),
            zones: vec!["1".into()],
            provisioning_state: Some("Succeeded".into()),
            ..Default::default()
        }
    }

    fn make_fleet(sku: LoadBalancerSku) -> (MemoryCloud, UniformVmSet) {
        let cloud = MemoryCloud::new();
        let mut scale_set = ScaleSet {
            id: format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/pool"),
            name: "pool".into(),
            resource_group: "rg".into(),
            location: "westus".into(),
            provisioning_state: Some("Succeeded".into()),
            capacity: Some(2),
            orchestration_mode: OrchestrationMode::Uniform,
            vm_profile: Some(ScaleSetVmProfile {
                computer_name_prefix: Some("aks-pool-".into()),
                network_configurations: vec![make_nic_config()],
            }),
            ..Default::default()
        };
        scale_set.tags.insert(TAG_BATCH_OPERATION.into(), "true".into());
        scale_set.tags.insert(TAG_CIDR_MASK_IPV4.into(), "26".into());
        cloud.put_scale_set(scale_set);
        for iid in 0..2 {
            cloud.put_scale_set_vm("rg", "pool", make_instance(iid));
        }

        let config = CloudConfig {
            resource_group: "rg".into(),
            location: "westus".into(),
            vm_type: VmType::Vmss,
            load_balancer_sku: sku,
            primary_scale_set_name: "pool".into(),
            put_vmss_vm_batch_size: 2,
            ..Default::default()
        }
        .validate()
        .unwrap();
        let backend = UniformVmSet::new(
            Arc::new(config),
            Arc::new(cloud.clone()),
            Arc::new(cloud.clone()),
            Arc::new(NodeProjection::new("rg", "westus")),
        );
        (cloud, backend)
    }

    fn make_node(iid: u32) -> Node {
        Node {
            name: format!("aks-pool-{iid:06}"),
            provider_id: Some(format!("azure://{}", instance_id(iid))),
            ..Default::default()
        }
    }

    fn make_service() -> ServiceRef {
        ServiceRef {
            namespace: "default".into(),
            name: "web".into(),
            ..Default::default()
        }
    }

    fn pool_id() -> String {
        ids::backend_pool_id("sub", "rg", "kubernetes", "kubernetes")
    }

    fn instance_pools(cloud: &MemoryCloud, iid: u32) -> Vec<String> {
        cloud
            .scale_set_vm("rg", "pool", &iid.to_string())
            .unwrap()
            .nic_configurations()[0]
            .ip_configurations[0]
            .backend_pools
            .clone()
    }

    fn template_pools(cloud: &MemoryCloud) -> Vec<String> {
        cloud.scale_set("rg", "pool").unwrap().vm_profile.unwrap().network_configurations[0]
            .ip_configurations[0]
            .backend_pools
            .clone()
    }

    #[tokio::test]
    async fn test_uniform_node_queries() {
        let (_cloud, backend) = make_fleet(LoadBalancerSku::Basic);

        assert_eq!(backend.get_power_status("aks-pool-000001").await.unwrap(), "running");
        let zone = backend.get_zone_by_node_name("aks-pool-000001").await.unwrap();
        assert_eq!(zone.failure_domain, "westus-1");
        assert_eq!(
            backend.get_instance_id_by_node_name("aks-pool-000001").await.unwrap(),
            instance_id(1)
        );
        assert_eq!(
            backend.get_node_vm_set_name(&make_node(0)).await.unwrap(),
            "pool"
        );

        let masks = backend
            .get_node_cidr_masks_by_provider_id(&format!("azure://{}", instance_id(1)))
            .await
            .unwrap();
        assert_eq!(masks.ipv4, 26);
        assert_eq!(masks.ipv6, 64);
    }

    #[tokio::test]
    async fn test_node_name_by_provider_id_with_scale_set_prefix() {
        let (_cloud, backend) = make_fleet(LoadBalancerSku::Basic);
        let managed_by = format!("azure://{SUB}/Microsoft.Compute/virtualMachineScaleSets/pool/virtualMachines/pool_1");

        assert_eq!(
            backend.get_node_name_by_provider_id(&managed_by).await.unwrap(),
            "aks-pool-000001"
        );
        assert_eq!(
            backend
                .get_node_name_by_ip_configuration_id(&ip_config_id(0))
                .await
                .unwrap(),
            ("aks-pool-000000".to_string(), "pool".to_string())
        );
    }

    #[tokio::test]
    async fn test_ensure_hosts_in_pool_updates_instances_and_template() {
        let (cloud, backend) = make_fleet(LoadBalancerSku::Standard);
        let nodes = vec![make_node(0), make_node(1)];

        backend
            .ensure_hosts_in_pool(&make_service(), &nodes, &pool_id(), "")
            .await
            .unwrap();
        assert_eq!(instance_pools(&cloud, 0), vec![pool_id()]);
        assert_eq!(instance_pools(&cloud, 1), vec![pool_id()]);
        assert_eq!(template_pools(&cloud), vec![pool_id()]);
        assert_eq!(cloud.call_count("begin_update"), 2);
        assert_eq!(cloud.call_count("create_or_update_scale_set"), 1);

        // Membership is already in place everywhere.
        backend
            .ensure_hosts_in_pool(&make_service(), &nodes, &pool_id(), "")
            .await
            .unwrap();
        assert_eq!(cloud.call_count("begin_update"), 2);
        assert_eq!(cloud.call_count("create_or_update_scale_set"), 1);
    }

    #[tokio::test]
    async fn test_basic_lb_skips_other_scale_sets() {
        let (cloud, backend) = make_fleet(LoadBalancerSku::Basic);

        backend
            .ensure_hosts_in_pool(&make_service(), &[make_node(0)], &pool_id(), "other")
            .await
            .unwrap();
        assert!(instance_pools(&cloud, 0).is_empty());
        assert!(template_pools(&cloud).is_empty());
        assert_eq!(cloud.call_count("begin_update"), 0);
    }

    #[tokio::test]
    async fn test_ensure_backend_pool_deleted() {
        let (cloud, backend) = make_fleet(LoadBalancerSku::Standard);
        let nodes = vec![make_node(0), make_node(1)];
        backend
            .ensure_hosts_in_pool(&make_service(), &nodes, &pool_id(), "")
            .await
            .unwrap();

        let changed = backend
            .ensure_backend_pool_deleted(
                &make_service(),
                &pool_id(),
                "",
                &[ip_config_id(0), ip_config_id(1)],
                true,
            )
            .await
            .unwrap();
        assert!(changed);
        assert!(instance_pools(&cloud, 0).is_empty());
        assert!(instance_pools(&cloud, 1).is_empty());
        assert!(template_pools(&cloud).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_is_instance_not_found() {
        let (_cloud, backend) = make_fleet(LoadBalancerSku::Basic);
        let err = backend.get_power_status("not-a-node").await.unwrap_err();
        assert!(err.is_instance_not_found());
    }
}
