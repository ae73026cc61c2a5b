//! Data model shared by the caches, the VM-set backends and the control-plane clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Well-known values
// =============================================================================

pub const PROVISIONING_STATE_DELETING: &str = "Deleting";
pub const PROVISIONING_STATE_DEALLOCATING: &str = "Deallocating";
pub const PROVISIONING_STATE_UNKNOWN: &str = "Unknown";
pub const NIC_FAILED_STATE: &str = "Failed";

pub const POWER_STATE_PREFIX: &str = "PowerState/";
pub const POWER_STATE_STOPPED: &str = "stopped";

/// Scale-set tag that opts into concurrent instance updates.
pub const TAG_BATCH_OPERATION: &str = "aks-vmss-batch-operation";
pub const TAG_CIDR_MASK_IPV4: &str = "kubernetesNodeCIDRMaskIPV4";
pub const TAG_CIDR_MASK_IPV6: &str = "kubernetesNodeCIDRMaskIPV6";
/// Disk tag (lowercase) enabling write acceleration.
pub const TAG_WRITE_ACCELERATOR: &str = "writeacceleratorenabled";

pub const DEFAULT_NODE_MASK_IPV4: u8 = 24;
pub const DEFAULT_NODE_MASK_IPV6: u8 = 64;

// =============================================================================
// VM sets
// =============================================================================

/// Which backend owns a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSetKind {
    AvailabilitySet,
    UniformScaleSet,
    FlexScaleSet,
    Unknown,
}

impl std::fmt::Display for VmSetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmSetKind::AvailabilitySet => write!(f, "availability-set"),
            VmSetKind::UniformScaleSet => write!(f, "uniform-scale-set"),
            VmSetKind::FlexScaleSet => write!(f, "flex-scale-set"),
            VmSetKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrchestrationMode {
    #[default]
    Uniform,
    Flexible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpVersion {
    #[default]
    IPv4,
    IPv6,
}

/// An IP configuration on a NIC or on a scale-set NIC template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfiguration {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub version: IpVersion,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub public_ip_address: Option<String>,
    /// Ids of the load-balancer backend pools this configuration belongs to.
    #[serde(default)]
    pub backend_pools: Vec<String>,
}

/// A NIC configuration on a scale-set template or scale-set instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicConfiguration {
    pub name: String,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
}

/// Scale-set metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSet {
    pub id: String,
    pub name: String,
    pub resource_group: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub orchestration_mode: OrchestrationMode,
    /// `None` when the scale set has no VM template.
    #[serde(default)]
    pub vm_profile: Option<ScaleSetVmProfile>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetVmProfile {
    #[serde(default)]
    pub computer_name_prefix: Option<String>,
    #[serde(default)]
    pub network_configurations: Vec<NicConfiguration>,
}

impl ScaleSet {
    pub fn is_deallocating(&self) -> bool {
        self.provisioning_state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(PROVISIONING_STATE_DEALLOCATING))
    }

    /// Computer names of instances start with this prefix.
    pub fn computer_name_prefix(&self) -> &str {
        self.vm_profile
            .as_ref()
            .and_then(|p| p.computer_name_prefix.as_deref())
            .unwrap_or(&self.name)
    }

    pub fn batch_operation_enabled(&self) -> bool {
        self.tags
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(TAG_BATCH_OPERATION) && v.eq_ignore_ascii_case("true"))
    }
}

/// An availability set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

// =============================================================================
// Virtual machines
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachingMode {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreateOption {
    #[default]
    Attach,
    Empty,
    FromImage,
}

/// A data disk in a VM's storage profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    pub lun: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub managed_disk_id: Option<String>,
    #[serde(default)]
    pub vhd_uri: Option<String>,
    #[serde(default)]
    pub caching: CachingMode,
    #[serde(default)]
    pub write_accelerator_enabled: bool,
    #[serde(default)]
    pub disk_encryption_set_id: Option<String>,
    /// Detach at the next committed update.
    #[serde(default)]
    pub to_be_detached: bool,
    #[serde(default)]
    pub create_option: CreateOption,
}

impl DataDisk {
    /// True if this entry refers to the disk with `name` or `uri`.
    pub fn matches(&self, name: &str, uri: &str) -> bool {
        let by_name = !name.is_empty()
            && self
                .name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name));
        let by_vhd = !uri.is_empty()
            && self
                .vhd_uri
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(uri));
        let by_id = !uri.is_empty()
            && self
                .managed_disk_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(uri));
        by_name || by_vhd || by_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    /// Status codes such as `PowerState/running` or `ProvisioningState/succeeded`.
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default)]
    pub platform_fault_domain: Option<i32>,
}

/// A NIC reference in a VM's network profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceReference {
    pub id: String,
    #[serde(default)]
    pub primary: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub interfaces: Vec<InterfaceReference>,
    /// NIC configurations carried by scale-set instances.
    #[serde(default)]
    pub configurations: Vec<NicConfiguration>,
}

/// A VM document as returned by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    /// Set for scale-set instances.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub computer_name: Option<String>,
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
    #[serde(default)]
    pub data_disks: Vec<DataDisk>,
    #[serde(default)]
    pub instance_view: Option<InstanceView>,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub availability_set_id: Option<String>,
    /// Parent scale set of a flex instance.
    #[serde(default)]
    pub scale_set_id: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl VirtualMachine {
    pub fn is_deleting(&self) -> bool {
        self.provisioning_state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(PROVISIONING_STATE_DELETING))
    }

    /// Power state without the `PowerState/` prefix, `stopped` when unknown.
    pub fn power_state(&self) -> String {
        self.instance_view
            .as_ref()
            .and_then(|view| {
                view.statuses
                    .iter()
                    .find_map(|code| code.strip_prefix(POWER_STATE_PREFIX))
            })
            .unwrap_or(POWER_STATE_STOPPED)
            .to_string()
    }

    pub fn provisioning_state_or_unknown(&self) -> String {
        self.provisioning_state
            .clone()
            .unwrap_or_else(|| PROVISIONING_STATE_UNKNOWN.to_string())
    }

    /// Id of the primary NIC: the sole NIC, or the one marked primary.
    pub fn primary_interface_id(&self) -> Option<&str> {
        let interfaces = &self.network_profile.as_ref()?.interfaces;
        if interfaces.len() == 1 {
            return Some(&interfaces[0].id);
        }
        interfaces
            .iter()
            .find(|nic| nic.primary == Some(true))
            .map(|nic| nic.id.as_str())
    }

    pub fn nic_configurations(&self) -> &[NicConfiguration] {
        self.network_profile
            .as_ref()
            .map(|p| p.configurations.as_slice())
            .unwrap_or_default()
    }
}

/// Partial VM update. Only the parts that are `Some` are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmUpdate {
    #[serde(default)]
    pub data_disks: Option<Vec<DataDisk>>,
    #[serde(default)]
    pub network_configurations: Option<Vec<NicConfiguration>>,
}

impl VmUpdate {
    pub fn storage(data_disks: Vec<DataDisk>) -> Self {
        Self {
            data_disks: Some(data_disks),
            network_configurations: None,
        }
    }

    pub fn network(configurations: Vec<NicConfiguration>) -> Self {
        Self {
            data_disks: None,
            network_configurations: Some(configurations),
        }
    }
}

// =============================================================================
// Disks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskState {
    #[default]
    Unattached,
    Attached,
    Reserved,
    ActiveSas,
}

/// A managed disk document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size_gb: i32,
    /// Id of the VM the disk is attached to.
    #[serde(default)]
    pub managed_by: Option<String>,
    #[serde(default)]
    pub state: DiskState,
    #[serde(default)]
    pub max_shares: Option<i32>,
    #[serde(default)]
    pub encryption_set_id: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Disk {
    pub fn write_accelerator_enabled(&self) -> bool {
        self.tags.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case(TAG_WRITE_ACCELERATOR) && v.eq_ignore_ascii_case("true")
        })
    }
}

// =============================================================================
// Network
// =============================================================================

/// A network interface resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    /// Id of the VM the NIC is attached to.
    #[serde(default)]
    pub virtual_machine_id: Option<String>,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
}

/// An address entry of a backend pool in node-IP mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAddress {
    pub name: String,
    pub ip_address: String,
    #[serde(default)]
    pub virtual_network_id: Option<String>,
}

/// A load-balancer backend pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPool {
    pub id: String,
    pub name: String,
    /// Member IP configurations (node-IP-configuration mode).
    #[serde(default)]
    pub ip_configuration_ids: Vec<String>,
    /// Member addresses (node-IP mode).
    #[serde(default)]
    pub addresses: Vec<BackendAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub name: String,
    #[serde(default)]
    pub backend_pools: Vec<BackendPool>,
    #[serde(default)]
    pub etag: Option<String>,
}

/// The orchestrator service a load balancer is reconciled for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    /// Cluster IP is IPv6.
    #[serde(default)]
    pub ipv6: bool,
    /// Requests an internal load balancer.
    #[serde(default)]
    pub internal: bool,
    /// Comma-separated VM-set names, or `__auto__`, selecting load-balancer placement.
    #[serde(default)]
    pub load_balancer_mode: Option<String>,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Orchestrator nodes
// =============================================================================

pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_ZONE_BETA: &str = "failure-domain.beta.kubernetes.io/zone";
pub const LABEL_EXTERNAL_RESOURCE_GROUP: &str = "kubernetes.azure.com/resource-group";
pub const LABEL_MANAGED: &str = "kubernetes.azure.com/managed";
pub const LABEL_NOT_MANAGED_VALUE: &str = "false";
pub const LABEL_EXCLUDE_BALANCERS: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
pub const LABEL_ROLE_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_ROLE: &str = "kubernetes.io/role";
pub const TAINT_UNINITIALIZED: &str = "node.cloudprovider.kubernetes.io/uninitialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    InternalIP,
    ExternalIP,
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: AddressType,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub effect: String,
}

/// The orchestrator's view of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// The `Ready` condition is true.
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    pub fn zone_label(&self) -> Option<&str> {
        self.labels
            .get(LABEL_ZONE)
            .or_else(|| self.labels.get(LABEL_ZONE_BETA))
            .map(String::as_str)
    }

    pub fn is_unmanaged(&self) -> bool {
        self.labels
            .get(LABEL_MANAGED)
            .is_some_and(|v| v.eq_ignore_ascii_case(LABEL_NOT_MANAGED_VALUE))
    }

    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(LABEL_ROLE_MASTER)
            || self.labels.contains_key(LABEL_ROLE_CONTROL_PLANE)
            || self.labels.get(LABEL_ROLE).is_some_and(|r| r == "master")
    }

    pub fn has_uninitialized_taint(&self) -> bool {
        self.taints.iter().any(|t| t.key == TAINT_UNINITIALIZED)
    }

    pub fn private_ips(&self) -> impl Iterator<Item = &str> {
        self.addresses
            .iter()
            .filter(|a| a.kind == AddressType::InternalIP)
            .map(|a| a.address.as_str())
    }

    /// Private IP matching the service's IP family.
    pub fn private_ip_for(&self, ipv6: bool) -> Option<&str> {
        self.private_ips().find(|ip| ip.contains(':') == ipv6)
    }
}
