//! Node projection.
//!
//! Derived sets over the orchestrator's nodes, kept current by node
//! add/update/delete events. All handlers take the single writer lock of the
//! projection; queries share the reader side.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CloudError, Result};
use crate::ids;
use crate::model::Node;

/// A node informer event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    Added { node: Node },
    Updated { old: Node, new: Node },
    Deleted { node: Node },
}

impl NodeEvent {
    pub fn node_name(&self) -> &str {
        match self {
            NodeEvent::Added { node } | NodeEvent::Deleted { node } => &node.name,
            NodeEvent::Updated { new, .. } => &new.name,
        }
    }
}

/// Informer lifecycle as seen by the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum InformerState {
    /// No informer; queries fall back to configuration.
    #[default]
    Detached,
    Syncing,
    Synced,
}

/// Snapshot of the derived node sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCaches {
    pub node_names: BTreeSet<String>,
    /// zone -> node names
    pub node_zones: BTreeMap<String, BTreeSet<String>>,
    /// node name -> lowercased external resource group
    pub node_resource_groups: BTreeMap<String, String>,
    pub unmanaged_nodes: BTreeSet<String>,
    pub exclude_load_balancer_nodes: BTreeSet<String>,
    /// node name -> private IPs
    pub node_private_ips: BTreeMap<String, BTreeSet<String>>,
}

impl NodeCaches {
    fn remove(&mut self, node: &Node, deleting: bool) {
        let name = node.name.as_str();
        self.node_names.remove(name);

        if let Some(zone) = node.zone_label() {
            if let Some(members) = self.node_zones.get_mut(zone) {
                members.remove(name);
                if members.is_empty() {
                    self.node_zones.remove(zone);
                }
            }
        }

        if node.labels.contains_key(crate::model::LABEL_EXTERNAL_RESOURCE_GROUP) {
            self.node_resource_groups.remove(name);
        }

        if node.is_unmanaged() {
            self.unmanaged_nodes.remove(name);
        }

        // A deleted node must leave every backend pool.
        if deleting {
            self.exclude_load_balancer_nodes.insert(name.to_string());
        }

        if let Some(ips) = self.node_private_ips.get_mut(name) {
            for ip in node.private_ips() {
                debug!("removing IP address {} of the node {}", ip, name);
                ips.remove(ip);
            }
            if ips.is_empty() {
                self.node_private_ips.remove(name);
            }
        }
    }

    fn insert(&mut self, node: &Node, location: &str) {
        let name = node.name.clone();
        self.node_names.insert(name.clone());

        if let Some(zone) = node.zone_label() {
            if is_availability_zone(zone, location) {
                self.node_zones
                    .entry(zone.to_string())
                    .or_default()
                    .insert(name.clone());
            }
        }

        if let Some(rg) = node
            .labels
            .get(crate::model::LABEL_EXTERNAL_RESOURCE_GROUP)
            .filter(|rg| !rg.is_empty())
        {
            self.node_resource_groups
                .insert(name.clone(), rg.to_lowercase());
        }

        let unmanaged = node.is_unmanaged();
        if unmanaged {
            self.unmanaged_nodes.insert(name.clone());
        }

        let excluded = unmanaged
            || node.labels.contains_key(crate::model::LABEL_EXCLUDE_BALANCERS)
            // Fresh nodes still carry the uninitialized taint and stay in the pools.
            || (!node.ready && !node.has_uninitialized_taint());
        if excluded {
            self.exclude_load_balancer_nodes.insert(name.clone());
        } else {
            self.exclude_load_balancer_nodes.remove(&name);
        }

        for ip in node.private_ips() {
            debug!("adding IP address {} of the node {}", ip, name);
            self.node_private_ips
                .entry(name.clone())
                .or_default()
                .insert(ip.to_string());
        }
    }
}

/// Real zones are `<location>-<n>`; bare fault-domain digits are not.
pub fn is_availability_zone(zone: &str, location: &str) -> bool {
    !location.is_empty()
        && zone.len() > location.len() + 1
        && zone
            .get(..location.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(location))
        && zone.as_bytes()[location.len()] == b'-'
}

#[derive(Default)]
struct ProjectionState {
    informer: InformerState,
    caches: NodeCaches,
}

/// Projection of orchestrator nodes.
pub struct NodeProjection {
    resource_group: String,
    location: String,
    state: RwLock<ProjectionState>,
}

impl NodeProjection {
    pub fn new(resource_group: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            location: location.into(),
            state: RwLock::new(ProjectionState::default()),
        }
    }

    /// An informer is feeding events; queries fail until it reports synced.
    pub async fn attach_informer(&self) {
        let mut state = self.state.write().await;
        if state.informer == InformerState::Detached {
            info!("Setting up node informer");
            state.informer = InformerState::Syncing;
        }
    }

    pub async fn mark_synced(&self) {
        self.state.write().await.informer = InformerState::Synced;
    }

    /// Apply one informer event.
    pub async fn handle(&self, event: &NodeEvent) {
        match event {
            NodeEvent::Added { node } => self.update(None, Some(node)).await,
            NodeEvent::Updated { old, new } => self.update(Some(old), Some(new)).await,
            NodeEvent::Deleted { node } => self.update(Some(node), None).await,
        }
    }

    /// Remove the previous state of a node and add its new state.
    pub async fn update(&self, prev: Option<&Node>, new: Option<&Node>) {
        let mut state = self.state.write().await;
        if let Some(prev) = prev {
            state.caches.remove(prev, new.is_none());
        }
        if let Some(new) = new {
            state.caches.insert(new, &self.location);
        }
    }

    /// Read access to the caches, failing while the informer is syncing.
    /// `None` means no informer is attached.
    async fn read<T>(&self, op: &str, f: impl FnOnce(&NodeCaches) -> T) -> Result<Option<T>> {
        let state = self.state.read().await;
        match state.informer {
            InformerState::Detached => Ok(None),
            InformerState::Syncing => Err(CloudError::unexpected(format!(
                "node informer is not synced when trying to {op}"
            ))),
            InformerState::Synced => Ok(Some(f(&state.caches))),
        }
    }

    pub async fn snapshot(&self) -> NodeCaches {
        self.state.read().await.caches.clone()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Zones with at least one node.
    pub async fn active_zones(&self) -> Result<BTreeSet<String>> {
        self.read("get active zones", |c| {
            c.node_zones
                .iter()
                .filter(|(_, nodes)| !nodes.is_empty())
                .map(|(zone, _)| zone.clone())
                .collect()
        })
        .await?
        .ok_or_else(|| CloudError::unexpected("cloud provider doesn't have informers set"))
    }

    /// Resource group of a node: its external group, or the configured one.
    pub async fn node_resource_group(&self, node_name: &str) -> Result<String> {
        let cached = self
            .read("get node resource group", |c| {
                c.node_resource_groups.get(node_name).cloned()
            })
            .await?
            .flatten();
        Ok(cached.unwrap_or_else(|| self.resource_group.clone()))
    }

    /// Node names; empty without an informer.
    pub async fn node_names(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read("get node names", |c| c.node_names.clone())
            .await?
            .unwrap_or_default())
    }

    /// The configured resource group plus every external group.
    pub async fn resource_groups(&self) -> Result<BTreeSet<String>> {
        let mut groups = self
            .read("get resource groups", |c| {
                c.node_resource_groups.values().cloned().collect::<BTreeSet<_>>()
            })
            .await?
            .unwrap_or_default();
        groups.insert(self.resource_group.clone());
        Ok(groups)
    }

    pub async fn unmanaged_nodes(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read("get unmanaged nodes", |c| c.unmanaged_nodes.clone())
            .await?
            .unwrap_or_default())
    }

    pub async fn excluded_nodes(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read("get excluded nodes", |c| c.exclude_load_balancer_nodes.clone())
            .await?
            .unwrap_or_default())
    }

    /// True if the node is unmanaged, sits in a foreign resource group, or is
    /// labeled or marked for exclusion.
    pub async fn should_exclude_from_load_balancer(&self, node_name: &str) -> Result<bool> {
        let resource_group = &self.resource_group;
        Ok(self
            .read("fetch node caches", |c| {
                if let Some(rg) = c.node_resource_groups.get(node_name) {
                    if !rg.eq_ignore_ascii_case(resource_group) {
                        return true;
                    }
                }
                c.exclude_load_balancer_nodes.contains(node_name)
            })
            .await?
            .unwrap_or(false))
    }

    pub async fn is_node_unmanaged(&self, node_name: &str) -> Result<bool> {
        Ok(self.unmanaged_nodes().await?.contains(node_name))
    }

    pub fn is_node_unmanaged_by_provider_id(&self, provider_id: &str) -> bool {
        ids::is_unmanaged_provider_id(provider_id)
    }

    pub async fn node_private_ips(&self, node_name: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .read("get node private IPs", |c| {
                c.node_private_ips.get(node_name).cloned().unwrap_or_default()
            })
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressType, NodeAddress, Taint, TAINT_UNINITIALIZED};

    fn make_node(name: &str, labels: &[(&str, &str)], ready: bool) -> Node {
        Node {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ready,
            addresses: vec![NodeAddress {
                kind: AddressType::InternalIP,
                address: format!("10.0.0.{}", name.len()),
            }],
            ..Default::default()
        }
    }

    async fn make_projection() -> NodeProjection {
        let projection = NodeProjection::new("rg", "westeurope");
        projection.attach_informer().await;
        projection.mark_synced().await;
        projection
    }

    fn assert_consistent(caches: &NodeCaches) {
        for members in caches.node_zones.values() {
            assert!(members.is_subset(&caches.node_names));
        }
        for name in caches.node_resource_groups.keys() {
            assert!(caches.node_names.contains(name));
        }
        assert!(caches.unmanaged_nodes.is_subset(&caches.exclude_load_balancer_nodes));
    }

    #[test]
    fn test_is_availability_zone() {
        assert!(is_availability_zone("westeurope-1", "westeurope"));
        assert!(is_availability_zone("WestEurope-2", "westeurope"));
        assert!(!is_availability_zone("0", "westeurope"));
        assert!(!is_availability_zone("westeurope-", "westeurope"));
        assert!(!is_availability_zone("eastus-1", "westeurope"));
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let projection = make_projection().await;
        let node = make_node(
            "node-0",
            &[("topology.kubernetes.io/zone", "westeurope-1")],
            true,
        );

        projection.handle(&NodeEvent::Added { node: node.clone() }).await;
        let caches = projection.snapshot().await;
        assert!(caches.node_names.contains("node-0"));
        assert!(caches.node_zones["westeurope-1"].contains("node-0"));
        assert!(!caches.exclude_load_balancer_nodes.contains("node-0"));
        assert_eq!(projection.active_zones().await.unwrap().len(), 1);
        assert_consistent(&caches);

        projection.handle(&NodeEvent::Deleted { node }).await;
        let caches = projection.snapshot().await;
        assert!(!caches.node_names.contains("node-0"));
        assert!(caches.exclude_load_balancer_nodes.contains("node-0"));
        assert!(caches.node_zones.is_empty());
        assert!(caches.node_private_ips.is_empty());
        assert_consistent(&caches);
    }

    #[tokio::test]
    async fn test_fault_domain_zone_is_ignored() {
        let projection = make_projection().await;
        let node = make_node("node-0", &[("failure-domain.beta.kubernetes.io/zone", "1")], true);
        projection.handle(&NodeEvent::Added { node }).await;
        assert!(projection.active_zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_and_external_group() {
        let projection = make_projection().await;
        projection
            .handle(&NodeEvent::Added {
                node: make_node(
                    "onprem-0",
                    &[("kubernetes.azure.com/managed", "false")],
                    true,
                ),
            })
            .await;
        projection
            .handle(&NodeEvent::Added {
                node: make_node(
                    "external-0",
                    &[("kubernetes.azure.com/resource-group", "Other-RG")],
                    true,
                ),
            })
            .await;

        assert!(projection.is_node_unmanaged("onprem-0").await.unwrap());
        assert!(projection.should_exclude_from_load_balancer("onprem-0").await.unwrap());
        assert!(projection.should_exclude_from_load_balancer("external-0").await.unwrap());
        assert_eq!(projection.node_resource_group("external-0").await.unwrap(), "other-rg");
        assert_eq!(projection.node_resource_group("onprem-0").await.unwrap(), "rg");

        let groups = projection.resource_groups().await.unwrap();
        assert!(groups.contains("rg"));
        assert!(groups.contains("other-rg"));
        assert_consistent(&projection.snapshot().await);
    }

    #[tokio::test]
    async fn test_not_ready_exclusion_spares_fresh_nodes() {
        let projection = make_projection().await;

        projection
            .handle(&NodeEvent::Added {
                node: make_node("stale-0", &[], false),
            })
            .await;
        let mut fresh = make_node("fresh-0", &[], false);
        fresh.taints.push(Taint {
            key: TAINT_UNINITIALIZED.to_string(),
            effect: "NoSchedule".to_string(),
        });
        projection.handle(&NodeEvent::Added { node: fresh }).await;

        assert!(projection.should_exclude_from_load_balancer("stale-0").await.unwrap());
        assert!(!projection.should_exclude_from_load_balancer("fresh-0").await.unwrap());

        // Becoming ready brings the node back.
        let old = make_node("stale-0", &[], false);
        let new = make_node("stale-0", &[], true);
        projection.handle(&NodeEvent::Updated { old, new }).await;
        assert!(!projection.should_exclude_from_load_balancer("stale-0").await.unwrap());
    }

    #[tokio::test]
    async fn test_exclude_label() {
        let projection = make_projection().await;
        projection
            .handle(&NodeEvent::Added {
                node: make_node(
                    "node-0",
                    &[("node.kubernetes.io/exclude-from-external-load-balancers", "")],
                    true,
                ),
            })
            .await;
        assert!(projection.excluded_nodes().await.unwrap().contains("node-0"));
    }

    #[tokio::test]
    async fn test_sync_gating() {
        let projection = NodeProjection::new("rg", "westeurope");
        // Without an informer queries fall back to configuration.
        assert_eq!(projection.node_resource_group("n").await.unwrap(), "rg");
        assert!(projection.node_names().await.unwrap().is_empty());
        assert!(projection.active_zones().await.is_err());

        projection.attach_informer().await;
        assert!(projection.node_names().await.is_err());
        assert!(projection.resource_groups().await.is_err());

        projection.mark_synced().await;
        assert!(projection.node_names().await.is_ok());
    }

    #[tokio::test]
    async fn test_private_ips() {
        let projection = make_projection().await;
        let node = make_node("node-0", &[], true);
        projection.handle(&NodeEvent::Added { node }).await;
        let ips = projection.node_private_ips("node-0").await.unwrap();
        assert!(ips.contains("10.0.0.6"));
    }

    #[test]
    fn test_event_json() {
        let event: NodeEvent = serde_json::from_str(
            r#"{"type": "deleted", "node": {"name": "node-0"}}"#,
        )
        .unwrap();
        assert_eq!(event.node_name(), "node-0");
    }
}
