//! Test helpers for mvirt-cloud integration tests.
//!
//! Builds a small fleet in the in-memory control plane: one uniform scale set
//! `pool` with computer names `aks-pool-00000N`, optionally an availability-set
//! VM `as-vm-0` and a flex instance `flex-vm-0`, all in resource group `rg`.

#![allow(dead_code)]

use std::sync::Arc;

use mvirt_cloud::config::{LoadBalancerSku, VmType};
use mvirt_cloud::ids;
use mvirt_cloud::model::{
    AddressType, DataDisk, Disk, DiskState, InstanceView, InterfaceReference, IpConfiguration,
    LoadBalancer, NetworkInterface, NetworkProfile, NicConfiguration, Node, NodeAddress,
    OrchestrationMode, ScaleSet, ScaleSetVmProfile, ServiceRef, VirtualMachine,
};
use mvirt_cloud::{Cloud, CloudConfig, MemoryCloud};

pub const RG: &str = "rg";
pub const SUB: &str = "/subscriptions/sub/resourceGroups/rg/providers";

pub fn config() -> CloudConfig {
    CloudConfig {
        subscription_id: "sub".into(),
        resource_group: RG.into(),
        location: "westus".into(),
        vm_type: VmType::Vmss,
        cluster_name: "kubernetes".into(),
        primary_scale_set_name: "pool".into(),
        load_balancer_sku: LoadBalancerSku::Standard,
        vnet_name: "vnet".into(),
        ..Default::default()
    }
}

pub fn nic_config(name: &str) -> NicConfiguration {
    NicConfiguration {
        name: name.to_string(),
        primary: Some(true),
        ip_configurations: vec![IpConfiguration {
            name: "ipconfig1".into(),
            primary: Some(true),
            ..Default::default()
        }],
    }
}

pub fn instance_id(iid: u32) -> String {
    format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/pool/virtualMachines/{iid}")
}

pub fn instance_ip_config_id(iid: u32) -> String {
    format!("{}/networkInterfaces/pool-nic/ipConfigurations/ipconfig1", instance_id(iid))
}

pub fn instance_node_name(iid: u32) -> String {
    format!("aks-pool-{iid:06}")
}

pub fn scale_set(capacity: u64) -> ScaleSet {
    ScaleSet {
        id: format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/pool"),
        name: "pool".into(),
        resource_group: RG.into(),
        location: "westus".into(),
        provisioning_state: Some("Succeeded".into()),
        capacity: Some(capacity),
        orchestration_mode: OrchestrationMode::Uniform,
        vm_profile: Some(ScaleSetVmProfile {
            computer_name_prefix: Some("aks-pool-".into()),
            network_configurations: vec![nic_config("pool-nic")],
        }),
        ..Default::default()
    }
}

pub fn instance(iid: u32) -> VirtualMachine {
    VirtualMachine {
        id: instance_id(iid),
        name: format!("pool_{iid}"),
        location: "westus".into(),
        instance_id: Some(iid.to_string()),
        computer_name: Some(instance_node_name(iid)),
        network_profile: Some(NetworkProfile {
            interfaces: vec![InterfaceReference {
                id: format!("{}/networkInterfaces/pool-nic", instance_id(iid)),
                primary: Some(true),
            }],
            configurations: vec![nic_config("pool-nic")],
        }),
        instance_view: Some(InstanceView {
            statuses: vec!["ProvisioningState/succeeded".into(), "PowerState/running".into()],
            platform_fault_domain: Some(0),
        }),
        zones: vec!["1".into()],
        provisioning_state: Some("Succeeded".into()),
        ..Default::default()
    }
}

pub fn standalone_vm(name: &str, set_id: String, flex: bool) -> VirtualMachine {
    VirtualMachine {
        id: format!("{SUB}/Microsoft.Compute/virtualMachines/{name}"),
        name: name.to_string(),
        location: "westus".into(),
        computer_name: Some(name.to_string()),
        network_profile: Some(NetworkProfile {
            interfaces: vec![InterfaceReference {
                id: format!("{SUB}/Microsoft.Network/networkInterfaces/{name}-nic"),
                primary: Some(true),
            }],
            configurations: vec![],
        }),
        instance_view: Some(InstanceView {
            statuses: vec!["PowerState/deallocated".into()],
            platform_fault_domain: Some(2),
        }),
        provisioning_state: Some("Succeeded".into()),
        availability_set_id: (!flex).then(|| set_id.clone()),
        scale_set_id: flex.then_some(set_id),
        ..Default::default()
    }
}

pub fn standalone_ip_config_id(vm: &str) -> String {
    format!("{SUB}/Microsoft.Network/networkInterfaces/{vm}-nic/ipConfigurations/ipconfig1")
}

pub fn standalone_nic(vm: &str, ip: &str) -> NetworkInterface {
    NetworkInterface {
        id: format!("{SUB}/Microsoft.Network/networkInterfaces/{vm}-nic"),
        name: format!("{vm}-nic"),
        resource_group: RG.into(),
        provisioning_state: Some("Succeeded".into()),
        virtual_machine_id: Some(format!("{SUB}/Microsoft.Compute/virtualMachines/{vm}")),
        ip_configurations: vec![IpConfiguration {
            id: standalone_ip_config_id(vm),
            name: "ipconfig1".into(),
            primary: Some(true),
            private_ip_address: Some(ip.to_string()),
            ..Default::default()
        }],
    }
}

/// A memory control plane seeded with `instances` uniform instances.
pub fn seed(instances: u32) -> MemoryCloud {
    let memory = MemoryCloud::new();
    memory.put_scale_set(scale_set(u64::from(instances)));
    for iid in 0..instances {
        memory.put_scale_set_vm(RG, "pool", instance(iid));
    }
    memory
}

/// Add an availability-set VM `as-vm-0` and a flex instance `flex-vm-0`.
pub fn seed_standalone(memory: &MemoryCloud) {
    memory.put_vm(
        RG,
        standalone_vm(
            "as-vm-0",
            format!("{SUB}/Microsoft.Compute/availabilitySets/as-a"),
            false,
        ),
    );
    memory.put_interface(RG, standalone_nic("as-vm-0", "10.1.0.4"));

    let mut flex_set = scale_set(1);
    flex_set.id = format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/flex");
    flex_set.name = "flex".into();
    flex_set.orchestration_mode = OrchestrationMode::Flexible;
    flex_set
        .tags
        .insert("kubernetesNodeCIDRMaskIPV4".into(), "25".into());
    memory.put_scale_set(flex_set);
    memory.put_vm(
        RG,
        standalone_vm(
            "flex-vm-0",
            format!("{SUB}/Microsoft.Compute/virtualMachineScaleSets/flex"),
            true,
        ),
    );
    memory.put_interface(RG, standalone_nic("flex-vm-0", "10.2.0.4"));
}

pub fn build(memory: &MemoryCloud, config: CloudConfig) -> Arc<Cloud> {
    Arc::new(
        Cloud::new(config, Arc::new(memory.clone()), Arc::new(memory.clone()))
            .expect("valid config"),
    )
}

pub fn disk_uri(name: &str) -> String {
    format!("{SUB}/Microsoft.Compute/disks/{name}")
}

pub fn disk(name: &str, size_gb: i32) -> Disk {
    Disk {
        id: disk_uri(name),
        name: name.to_string(),
        size_gb,
        state: DiskState::Unattached,
        ..Default::default()
    }
}

pub fn data_disk(lun: i32, name: &str) -> DataDisk {
    DataDisk {
        lun,
        name: Some(name.to_string()),
        managed_disk_id: Some(disk_uri(name)),
        ..Default::default()
    }
}

pub fn node(name: &str, provider_id: &str, ip: &str) -> Node {
    Node {
        name: name.to_string(),
        provider_id: Some(format!("azure://{provider_id}")),
        ready: true,
        addresses: vec![NodeAddress {
            kind: AddressType::InternalIP,
            address: ip.to_string(),
        }],
        ..Default::default()
    }
}

pub fn instance_node(iid: u32) -> Node {
    node(&instance_node_name(iid), &instance_id(iid), &format!("10.0.0.{}", iid + 4))
}

pub fn service() -> ServiceRef {
    ServiceRef {
        namespace: "default".into(),
        name: "web".into(),
        ..Default::default()
    }
}

pub fn pool_id() -> String {
    ids::backend_pool_id("sub", RG, "kubernetes", "kubernetes")
}

pub fn load_balancer() -> LoadBalancer {
    LoadBalancer {
        name: "kubernetes".into(),
        ..Default::default()
    }
}

/// Backend pools referenced by the primary IP configuration of an instance.
pub fn instance_pools(memory: &MemoryCloud, iid: u32) -> Vec<String> {
    memory
        .scale_set_vm(RG, "pool", &iid.to_string())
        .expect("instance exists")
        .nic_configurations()[0]
        .ip_configurations[0]
        .backend_pools
        .clone()
}
