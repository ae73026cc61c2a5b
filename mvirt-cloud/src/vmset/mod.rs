//! VM-set backends.
//!
//! A [`VmSet`] answers per-node questions (ids, power state, zone, IPs) and
//! performs the VM updates behind disk attach/detach and load-balancer
//! membership. [`StandaloneVmSet`] serves availability-set and flex members;
//! [`UniformVmSet`] serves uniform scale-set instances and owns one standalone
//! backend of each kind, dispatching per node.

pub mod scale_set;
pub mod standalone;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backoff::{self, BackoffError};
use crate::cache::ReadMode;
use crate::client::{ComputeClient, UpdateFuture};
use crate::config::CloudConfig;
use crate::error::{CloudError, Result};
use crate::ids;
use crate::model::{
    CachingMode, CreateOption, DataDisk, IpConfiguration, IpVersion, NetworkInterface, NicConfiguration,
    Node, ServiceRef, VirtualMachine, VmSetKind, VmUpdate, DEFAULT_NODE_MASK_IPV4,
    DEFAULT_NODE_MASK_IPV6, TAG_CIDR_MASK_IPV4, TAG_CIDR_MASK_IPV6,
};

pub use scale_set::UniformVmSet;
pub use standalone::StandaloneVmSet;

/// Service load-balancer mode selecting every agent pool.
pub const AUTO_LOAD_BALANCER_MODE: &str = "__auto__";

// =============================================================================
// Capability types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}

/// Node CIDR mask sizes of a VM set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeCidrMasks {
    pub ipv4: u8,
    pub ipv6: u8,
}

impl Default for NodeCidrMasks {
    fn default() -> Self {
        Self {
            ipv4: DEFAULT_NODE_MASK_IPV4,
            ipv6: DEFAULT_NODE_MASK_IPV6,
        }
    }
}

impl NodeCidrMasks {
    /// Masks from scale-set tags; missing or malformed tags keep the default.
    pub fn from_tags(tags: &HashMap<String, String>) -> Self {
        let mut masks = Self::default();
        if let Some(v) = tags.get(TAG_CIDR_MASK_IPV4) {
            match v.parse() {
                Ok(mask) => masks.ipv4 = mask,
                Err(e) => warn!("failed to parse IPv4 node CIDR mask {:?}: {}", v, e),
            }
        }
        if let Some(v) = tags.get(TAG_CIDR_MASK_IPV6) {
            match v.parse() {
                Ok(mask) => masks.ipv6 = mask,
                Err(e) => warn!("failed to parse IPv6 node CIDR mask {:?}: {}", v, e),
            }
        }
        masks
    }
}

/// How a disk should be attached. `lun` is -1 until allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachOptions {
    pub lun: i32,
    pub disk_name: String,
    pub caching: CachingMode,
    pub encryption_set_id: Option<String>,
    pub write_accelerator: bool,
}

/// A VM the control plane can update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    ScaleSetVm {
        resource_group: String,
        scale_set: String,
        instance_id: String,
    },
    Vm {
        resource_group: String,
        name: String,
    },
}

impl UpdateTarget {
    /// Start an update of this VM.
    pub async fn begin(&self, compute: &dyn ComputeClient, update: VmUpdate) -> Result<UpdateFuture> {
        match self {
            UpdateTarget::ScaleSetVm {
                resource_group,
                scale_set,
                instance_id,
            } => {
                compute
                    .begin_update_scale_set_vm(resource_group, scale_set, instance_id, update)
                    .await
            }
            UpdateTarget::Vm {
                resource_group,
                name,
            } => compute.begin_update_vm(resource_group, name, update).await,
        }
    }
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateTarget::ScaleSetVm {
                resource_group,
                scale_set,
                instance_id,
            } => write!(f, "{resource_group}/{scale_set}/{instance_id}"),
            UpdateTarget::Vm {
                resource_group,
                name,
            } => write!(f, "{resource_group}/{name}"),
        }
    }
}

/// A scale-set instance update prepared by host-in-pool, flushed in batches.
#[derive(Debug, Clone)]
pub struct StagedUpdate {
    pub node_name: String,
    pub resource_group: String,
    pub scale_set: String,
    pub instance_id: String,
    pub update: VmUpdate,
}

/// Outcome of adding one host to a backend pool.
#[derive(Debug, Clone)]
pub enum PoolMembership {
    /// Already a member, or skipped.
    Unchanged,
    /// Written directly (standalone NIC update).
    Applied,
    /// Needs a scale-set instance update.
    Staged(StagedUpdate),
}

/// Runs a cache invalidation when dropped.
pub struct CacheInvalidation(Option<Box<dyn FnOnce() + Send + Sync>>);

impl CacheInvalidation {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl Drop for CacheInvalidation {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// A VM update accepted by the control plane but not yet completed.
///
/// The node's cached VM document is invalidated when this value is dropped,
/// whether or not [`PendingUpdate::wait`] ran to completion.
pub struct PendingUpdate {
    pub node_name: String,
    pub target: UpdateTarget,
    update: VmUpdate,
    compute: Arc<dyn ComputeClient>,
    completion: UpdateFuture,
    invalidation: CacheInvalidation,
}

impl PendingUpdate {
    pub fn new(
        node_name: impl Into<String>,
        target: UpdateTarget,
        update: VmUpdate,
        compute: Arc<dyn ComputeClient>,
        completion: UpdateFuture,
        invalidation: CacheInvalidation,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            target,
            update,
            compute,
            completion,
            invalidation,
        }
    }

    pub fn update(&self) -> &VmUpdate {
        &self.update
    }

    /// Wait for the update to finish.
    ///
    /// A preempted update is re-issued with exponential backoff. An error
    /// reported after the control plane accepted the update becomes
    /// [`CloudError::PartialUpdate`].
    pub async fn wait(self, source: &str) -> Result<()> {
        let PendingUpdate {
            node_name,
            target,
            update,
            compute,
            completion,
            invalidation: _invalidation,
        } = self;

        // The first attempt is the update already in flight.
        let mut in_flight = Some(completion);
        let (target, compute, update) = (&target, &compute, &update);
        let result = backoff::retry_notify(
            backoff::preemption_policy(),
            move || {
                let completion = in_flight.take();
                async move {
                    let result = match completion {
                        Some(completion) => completion.await,
                        None => match target.begin(&**compute, update.clone()).await {
                            Ok(completion) => completion.await,
                            Err(e) => Err(e),
                        },
                    };
                    result.map_err(|e| {
                        if e.is_preempted() {
                            BackoffError::transient(e)
                        } else {
                            BackoffError::permanent(e)
                        }
                    })
                }
            },
            |_: CloudError, delay: Duration| {
                warn!(
                    node = %node_name,
                    source,
                    "VM update on {} was preempted, retrying in {:?}",
                    target,
                    delay
                );
            },
        )
        .await;

        match result {
            Ok(()) => {
                debug!(node = %node_name, source, "VM update on {} finished", target);
                Ok(())
            }
            Err(e) if e.is_accepted() => Err(CloudError::PartialUpdate(format!(
                "{source} on node {node_name}: {e}"
            ))),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// The capability trait
// =============================================================================

/// Per-node operations of one VM-set kind.
#[async_trait]
pub trait VmSet: Send + Sync {
    fn kind(&self) -> VmSetKind;

    /// Resource id of the node's VM, resource group lowercased.
    async fn get_instance_id_by_node_name(&self, node_name: &str) -> Result<String>;

    /// Node name of a provider id or VM resource id.
    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String>;

    /// Power state without its `PowerState/` prefix.
    async fn get_power_status(&self, node_name: &str) -> Result<String>;

    async fn get_provisioning_state(&self, node_name: &str) -> Result<String>;

    async fn get_zone_by_node_name(&self, node_name: &str) -> Result<Zone>;

    /// Private and, if any, public IP of the node's primary IP configuration.
    async fn get_ip_by_node_name(&self, node_name: &str) -> Result<(String, Option<String>)>;

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface>;

    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<NodeCidrMasks>;

    /// Lowercased VM-set names hosting `nodes`.
    async fn get_agent_pool_vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>>;

    /// Lowercased VM-set name of one node; empty if it belongs to none.
    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String>;

    /// VM sets that should back the service's load balancer.
    async fn get_vm_set_names(&self, service: &ServiceRef, nodes: &[Node]) -> Result<Vec<String>>;

    /// `(node name, VM-set name)` owning a NIC IP configuration.
    async fn get_node_name_by_ip_configuration_id(&self, ip_config_id: &str) -> Result<(String, String)>;

    /// Add one node to a backend pool.
    async fn ensure_host_in_pool(
        &self,
        service: &ServiceRef,
        node: &Node,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<PoolMembership>;

    /// Add nodes to a backend pool.
    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()>;

    /// Remove the pool from the listed IP configurations; with
    /// `delete_from_vm_set`, also from the owning scale sets' templates.
    /// Returns true if anything was updated.
    async fn ensure_backend_pool_deleted(
        &self,
        service: &ServiceRef,
        backend_pool_id: &str,
        vm_set_name: &str,
        ip_configuration_ids: &[String],
        delete_from_vm_set: bool,
    ) -> Result<bool>;

    /// Data disks not flagged for detach, with the VM's provisioning state.
    async fn get_data_disks(
        &self,
        node_name: &str,
        mode: ReadMode,
    ) -> Result<(Vec<DataDisk>, Option<String>)>;

    /// Start attaching disks keyed by disk URI.
    async fn attach_disk(
        &self,
        node_name: &str,
        disks: &BTreeMap<String, AttachOptions>,
    ) -> Result<PendingUpdate>;

    /// Start detaching disks; keys are disk URIs, values disk names.
    async fn detach_disk(&self, node_name: &str, disks: &BTreeMap<String, String>) -> Result<PendingUpdate>;

    /// Start an empty update that commits pending deferred detaches.
    async fn update_vm(&self, node_name: &str) -> Result<PendingUpdate>;

    /// Drop the node's cached VM document.
    fn delete_cache_for_node(&self, node_name: &str);
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Whether a node in `node_vm_set` may join a load balancer fronting `vm_set_name`.
///
/// A single standard load balancer takes every VM set. Basic and multiple
/// standard load balancers only take their own set, except that sets listed
/// as sharing the primary standard load balancer may join it.
pub(crate) fn node_in_vm_set(config: &CloudConfig, vm_set_name: &str, node_vm_set: &str) -> bool {
    if vm_set_name.is_empty() || vm_set_name.eq_ignore_ascii_case(node_vm_set) {
        return true;
    }
    if !config.use_standard_load_balancer() {
        return false;
    }
    if !config.enable_multiple_standard_load_balancers {
        return true;
    }
    // TODO: settle whether sets sharing the primary load balancer may also join non-primary ones.
    if vm_set_name.eq_ignore_ascii_case(config.primary_vm_set_name())
        && config
            .vm_sets_sharing_primary_slb()
            .contains(&node_vm_set.to_lowercase())
    {
        debug!(
            "{} in vm set {} shares the primary load balancer",
            node_vm_set, vm_set_name
        );
        return true;
    }
    false
}

/// Mode requested by the service: `(has mode, is auto, named sets)`.
fn service_load_balancer_mode(service: &ServiceRef) -> (bool, bool, Vec<String>) {
    let Some(mode) = service.load_balancer_mode.as_deref().map(str::trim) else {
        return (false, false, Vec::new());
    };
    if mode.is_empty() {
        return (false, false, Vec::new());
    }
    if mode.eq_ignore_ascii_case(AUTO_LOAD_BALANCER_MODE) {
        return (true, true, Vec::new());
    }
    let names = mode
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (true, false, names)
}

/// Pick the VM sets backing a service's load balancer.
pub(crate) fn select_vm_set_names(
    config: &CloudConfig,
    service: &ServiceRef,
    primary: &str,
    agent_pools: Vec<String>,
) -> Result<Vec<String>> {
    let (has_mode, is_auto, wanted) = service_load_balancer_mode(service);
    if !has_mode || config.use_single_standard_load_balancer() {
        return Ok(vec![primary.to_string()]);
    }
    if agent_pools.is_empty() {
        return Err(CloudError::NotFound(format!(
            "no vm sets found for the nodes of service {service}"
        )));
    }
    if is_auto {
        return Ok(agent_pools);
    }

    let mut selected = Vec::with_capacity(wanted.len());
    for name in wanted {
        match agent_pools.iter().find(|pool| pool.eq_ignore_ascii_case(&name)) {
            Some(pool) => selected.push(pool.clone()),
            None => {
                return Err(CloudError::NotFound(format!("vm set ({name}) - not found")));
            }
        }
    }
    Ok(selected)
}

/// Zone of a VM: `<location>-<zone>` for zonal VMs, else the fault domain.
pub(crate) fn zone_of(vm: &VirtualMachine) -> Result<Zone> {
    let location = vm.location.to_lowercase();
    let failure_domain = if let Some(zone) = vm.zones.first() {
        let zone: u32 = zone
            .parse()
            .map_err(|e| CloudError::unexpected(format!("failed to parse zone {zone:?}: {e}")))?;
        format!("{location}-{zone}")
    } else if let Some(fault_domain) = vm.instance_view.as_ref().and_then(|v| v.platform_fault_domain) {
        fault_domain.to_string()
    } else {
        return Err(CloudError::unexpected(format!(
            "failed to get zone info of {}",
            vm.name
        )));
    };
    Ok(Zone {
        failure_domain,
        region: location,
    })
}

/// The sole NIC configuration, or the one marked primary.
pub(crate) fn primary_nic_configuration<'a>(
    configurations: &'a mut [NicConfiguration],
    owner: &str,
) -> Result<&'a mut NicConfiguration> {
    if configurations.len() == 1 {
        return Ok(&mut configurations[0]);
    }
    configurations
        .iter_mut()
        .find(|c| c.primary == Some(true))
        .ok_or_else(|| CloudError::unexpected(format!("failed to find a primary nic for {owner}")))
}

/// The IP configuration a backend pool belongs on.
///
/// Single-stack IPv4 clusters use the primary configuration; IPv6 and
/// dual-stack clusters use the configuration of the service's IP family.
pub(crate) fn select_ip_configuration<'a>(
    ip_configurations: &'a mut [IpConfiguration],
    ipv6: bool,
    dual_stack: bool,
    owner: &str,
) -> Result<&'a mut IpConfiguration> {
    if !dual_stack && !ipv6 {
        if ip_configurations.len() == 1 {
            return Ok(&mut ip_configurations[0]);
        }
        return ip_configurations
            .iter_mut()
            .find(|c| c.primary == Some(true))
            .ok_or_else(|| {
                CloudError::unexpected(format!("failed to find a primary IP configuration of {owner}"))
            });
    }

    let version = if ipv6 { IpVersion::IPv6 } else { IpVersion::IPv4 };
    ip_configurations
        .iter_mut()
        .find(|c| c.version == version)
        .ok_or_else(|| {
            CloudError::unexpected(format!(
                "failed to find an IP configuration (IPv6={ipv6}) of {owner}"
            ))
        })
}

/// Add a pool to an IP configuration.
///
/// Returns false when the pool is already referenced, or when a standard
/// load balancer would put the configuration behind a second load balancer.
pub(crate) fn add_backend_pool(
    ip_configuration: &mut IpConfiguration,
    backend_pool_id: &str,
    standard_lb: bool,
    owner: &str,
) -> Result<bool> {
    if ip_configuration
        .backend_pools
        .iter()
        .any(|p| p.eq_ignore_ascii_case(backend_pool_id))
    {
        return Ok(false);
    }
    if standard_lb && !ip_configuration.backend_pools.is_empty() {
        let (same_lb, old_lb) =
            ids::is_backend_pool_on_same_lb(backend_pool_id, &ip_configuration.backend_pools)?;
        if !same_lb {
            info!(
                "{} has already been added to LB {}, omit adding it to a new one",
                owner,
                old_lb.unwrap_or_default()
            );
            return Ok(false);
        }
    }
    ip_configuration.backend_pools.push(backend_pool_id.to_string());
    Ok(true)
}

/// Remove a pool from every IP configuration. Returns true if any referenced it.
pub(crate) fn remove_backend_pool(ip_configurations: &mut [IpConfiguration], backend_pool_id: &str) -> bool {
    let mut found = false;
    for ip_configuration in ip_configurations {
        let before = ip_configuration.backend_pools.len();
        ip_configuration
            .backend_pools
            .retain(|p| !p.eq_ignore_ascii_case(backend_pool_id));
        found |= ip_configuration.backend_pools.len() != before;
    }
    found
}

/// Private and public IP of a NIC's primary IP configuration.
pub(crate) fn interface_ips(nic: &NetworkInterface) -> Result<(String, Option<String>)> {
    let mut ip_configurations = nic.ip_configurations.clone();
    let primary = select_ip_configuration(&mut ip_configurations, false, false, &nic.name)?;
    let private_ip = primary.private_ip_address.clone().ok_or_else(|| {
        CloudError::unexpected(format!("nic {} has no private IP address", nic.name))
    })?;
    Ok((private_ip, primary.public_ip_address.clone()))
}

/// Data disks not flagged for deferred detach.
pub(crate) fn filter_detaching(disks: &[DataDisk]) -> Vec<DataDisk> {
    disks.iter().filter(|d| !d.to_be_detached).cloned().collect()
}

/// Current disks plus the disks to attach.
pub(crate) fn with_attached_disks(
    node_name: &str,
    current: &[DataDisk],
    attach: &BTreeMap<String, AttachOptions>,
) -> Result<Vec<DataDisk>> {
    let mut disks = filter_detaching(current);
    for (uri, options) in attach {
        let existing = disks.iter().find(|d| {
            d.managed_disk_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(uri))
        });
        if let Some(existing) = existing {
            if existing.lun == options.lun {
                info!(
                    "azureDisk - disk({}) already attached to node({}) on LUN({})",
                    uri, node_name, options.lun
                );
                continue;
            }
            return Err(CloudError::unexpected(format!(
                "disk({uri}) already attached to node({node_name}) on LUN({}), but target LUN is {}",
                existing.lun, options.lun
            )));
        }

        disks.push(DataDisk {
            lun: options.lun,
            name: Some(options.disk_name.clone()),
            managed_disk_id: Some(uri.clone()),
            vhd_uri: None,
            caching: options.caching,
            write_accelerator_enabled: options.write_accelerator,
            disk_encryption_set_id: options.encryption_set_id.clone(),
            to_be_detached: false,
            create_option: CreateOption::Attach,
        });
    }
    Ok(disks)
}

/// Current disks with the listed ones flagged for deferred detach, or removed
/// outright where the flag is unsupported.
pub(crate) fn with_detached_disks(
    node_name: &str,
    current: &[DataDisk],
    detach: &BTreeMap<String, String>,
    remove_outright: bool,
) -> Vec<DataDisk> {
    let mut disks = filter_detaching(current);
    let mut found = false;
    for disk in &mut disks {
        if detach.iter().any(|(uri, name)| disk.matches(name, uri)) {
            info!(
                "azureDisk - detach disk: name {:?} lun {} from node {}",
                disk.name, disk.lun, node_name
            );
            disk.to_be_detached = true;
            found = true;
        }
    }

    if !found {
        warn!(
            "detach azure disk on node({}): disk list({:?}) not found",
            node_name, detach
        );
    } else if remove_outright {
        disks.retain(|d| !d.to_be_detached);
    }
    disks
}

/// Drop managed disks that no longer exist. Lookup errors other than
/// not-found keep the disk.
pub async fn filter_non_existing_disks(compute: &dyn ComputeClient, disks: Vec<DataDisk>) -> Vec<DataDisk> {
    let mut filtered = Vec::with_capacity(disks.len());
    for disk in disks {
        if let Some(id) = disk.managed_disk_id.as_deref() {
            let exists = match ids::parse_managed_disk_id(id) {
                Ok(parsed) => match compute.get_disk(&parsed.resource_group, &parsed.name).await {
                    Ok(_) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => {
                        warn!("checking whether disk {} exists failed: {}", id, e);
                        true
                    }
                },
                Err(e) => {
                    warn!("checking whether disk {} exists failed: {}", id, e);
                    true
                }
            };
            if !exists {
                warn!("disk({}) does not exist, removed from data disk list", id);
                continue;
            }
        }
        filtered.push(disk);
    }
    filtered
}

/// Begin a storage-profile update; on not-found, drop vanished disks and retry once.
pub(crate) async fn begin_storage_update(
    compute: &dyn ComputeClient,
    target: &UpdateTarget,
    disks: Vec<DataDisk>,
) -> Result<(UpdateFuture, VmUpdate)> {
    let update = VmUpdate::storage(disks);
    match target.begin(compute, update.clone()).await {
        Ok(completion) => Ok((completion, update)),
        Err(e) if e.is_not_found() => {
            warn!(
                "azureDisk - update of {} failed with {}, filtering non-existing disks",
                target, e
            );
            let disks = filter_non_existing_disks(compute, update.data_disks.unwrap_or_default()).await;
            let update = VmUpdate::storage(disks);
            let completion = target.begin(compute, update.clone()).await?;
            Ok((completion, update))
        }
        Err(e) => Err(e),
    }
}
