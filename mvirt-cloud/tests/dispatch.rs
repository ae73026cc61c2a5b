//! Node queries across a fleet mixing uniform, availability-set and flex VMs.

mod common;

use std::sync::Arc;

use common::{
    RG, SUB, build, config, instance_id, instance_node, instance_node_name, node, seed, seed_standalone,
    standalone_ip_config_id,
};
use mvirt_cloud::model::{LABEL_EXCLUDE_BALANCERS, Node};
use mvirt_cloud::{Cloud, MemoryCloud, NodeEvent};

fn mixed_fleet() -> (MemoryCloud, Arc<Cloud>) {
    let memory = seed(2);
    seed_standalone(&memory);
    let mut cfg = config();
    cfg.enable_vmss_flex_nodes = true;
    let cloud = build(&memory, cfg);
    (memory, cloud)
}

fn vm_id(name: &str) -> String {
    format!("{SUB}/Microsoft.Compute/virtualMachines/{name}")
}

#[tokio::test]
async fn test_power_status_per_kind() {
    let (_memory, cloud) = mixed_fleet();
    let vm_set = cloud.vm_set();

    assert_eq!(vm_set.get_power_status(&instance_node_name(0)).await.unwrap(), "running");
    assert_eq!(vm_set.get_power_status("as-vm-0").await.unwrap(), "deallocated");
    assert_eq!(vm_set.get_power_status("flex-vm-0").await.unwrap(), "deallocated");
    assert!(vm_set.get_power_status("not-a-node").await.unwrap_err().is_instance_not_found());
}

#[tokio::test]
async fn test_instance_ids_and_provider_ids() {
    let (_memory, cloud) = mixed_fleet();
    let vm_set = cloud.vm_set();

    assert_eq!(
        vm_set.get_instance_id_by_node_name(&instance_node_name(1)).await.unwrap(),
        instance_id(1)
    );
    assert_eq!(vm_set.get_instance_id_by_node_name("as-vm-0").await.unwrap(), vm_id("as-vm-0"));
    assert_eq!(
        vm_set
            .get_node_name_by_provider_id(&format!("azure://{}", vm_id("flex-vm-0")))
            .await
            .unwrap(),
        "flex-vm-0"
    );
    assert_eq!(
        vm_set
            .get_node_name_by_provider_id(&format!("azure://{}", instance_id(0)))
            .await
            .unwrap(),
        instance_node_name(0)
    );
}

#[tokio::test]
async fn test_vm_set_names_and_ips() {
    let (_memory, cloud) = mixed_fleet();
    let vm_set = cloud.vm_set();

    assert_eq!(vm_set.get_node_vm_set_name(&instance_node(0)).await.unwrap(), "pool");
    assert_eq!(
        vm_set
            .get_node_vm_set_name(&node("as-vm-0", &vm_id("as-vm-0"), "10.1.0.4"))
            .await
            .unwrap(),
        "as-a"
    );
    assert_eq!(
        vm_set
            .get_node_vm_set_name(&node("flex-vm-0", &vm_id("flex-vm-0"), "10.2.0.4"))
            .await
            .unwrap(),
        "flex"
    );
    assert_eq!(
        vm_set.get_ip_by_node_name("as-vm-0").await.unwrap(),
        ("10.1.0.4".to_string(), None)
    );
    assert_eq!(
        vm_set
            .get_node_name_by_ip_configuration_id(&standalone_ip_config_id("as-vm-0"))
            .await
            .unwrap(),
        ("as-vm-0".to_string(), "as-a".to_string())
    );
}

#[tokio::test]
async fn test_cidr_masks() {
    let (_memory, cloud) = mixed_fleet();
    let vm_set = cloud.vm_set();

    let flex = vm_set
        .get_node_cidr_masks_by_provider_id(&format!("azure://{}", vm_id("flex-vm-0")))
        .await
        .unwrap();
    assert_eq!(flex.ipv4, 25);
    assert_eq!(flex.ipv6, 64);

    let availability_set = vm_set
        .get_node_cidr_masks_by_provider_id(&format!("azure://{}", vm_id("as-vm-0")))
        .await
        .unwrap();
    assert_eq!(availability_set.ipv4, 24);

    let uniform = vm_set
        .get_node_cidr_masks_by_provider_id(&format!("azure://{}", instance_id(0)))
        .await
        .unwrap();
    assert_eq!(uniform.ipv4, 24);
}

#[tokio::test]
async fn test_zones() {
    let (_memory, cloud) = mixed_fleet();
    let vm_set = cloud.vm_set();

    let zone = vm_set.get_zone_by_node_name(&instance_node_name(0)).await.unwrap();
    assert_eq!(zone.failure_domain, "westus-1");
    assert_eq!(zone.region, "westus");

    // Standalone VMs without zones report their fault domain.
    let zone = vm_set.get_zone_by_node_name("as-vm-0").await.unwrap();
    assert_eq!(zone.failure_domain, "2");
}

#[tokio::test]
async fn test_node_events_feed_projection() {
    let (_memory, cloud) = mixed_fleet();
    let projection = cloud.projection();
    projection.attach_informer().await;

    let mut excluded = instance_node(1);
    excluded
        .labels
        .insert(LABEL_EXCLUDE_BALANCERS.to_string(), "true".to_string());
    for node in [instance_node(0), excluded.clone()] {
        cloud.handle_node_event(&NodeEvent::Added { node }).await;
    }
    projection.mark_synced().await;

    assert!(projection.excluded_nodes().await.unwrap().contains(&excluded.name));
    assert!(!projection
        .should_exclude_from_load_balancer(&instance_node_name(0))
        .await
        .unwrap());
    assert!(projection
        .node_private_ips(&instance_node_name(0))
        .await
        .unwrap()
        .contains("10.0.0.4"));

    // A deleted node stays excluded until it is seen again.
    let deleted: Node = excluded;
    let name = deleted.name.clone();
    cloud.handle_node_event(&NodeEvent::Deleted { node: deleted }).await;
    assert!(!projection.node_names().await.unwrap().contains(&name));
    assert!(projection.excluded_nodes().await.unwrap().contains(&name));
    assert!(projection.node_names().await.unwrap().contains(&instance_node_name(0)));
}

#[tokio::test]
async fn test_removed_resource_group_fails_lookup() {
    let memory = seed(1);
    memory.remove_resource_group(RG);
    let cloud = build(&memory, config());

    assert!(cloud
        .vm_set()
        .get_power_status(&instance_node_name(0))
        .await
        .is_err());
}
