//! Backend-pool membership modes.
//!
//! In node-IP-configuration mode VMs join a pool through their NIC IP
//! configurations, which the [`VmSet`] updates. In node-IP mode the pool holds
//! plain node addresses and is written through the network API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::NetworkClient;
use crate::config::CloudConfig;
use crate::error::{CloudError, Result};
use crate::ids;
use crate::model::{self, BackendAddress, LoadBalancer, Node, ServiceRef};
use crate::nodes::NodeProjection;
use crate::vmset::VmSet;

/// Result of [`BackendPool::reconcile_backend_pools`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolReconcile {
    /// The pool is managed outside this cluster.
    pub pre_configured: bool,
    /// The load balancer document was modified and must be written back.
    pub changed: bool,
}

/// Predicate over VM set names.
pub type VmSetFilter = dyn for<'a> Fn(&'a str) -> bool + Send + Sync;

/// One way of putting nodes into load-balancer backend pools.
#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Add nodes to `pool` of load balancer `lb_name`.
    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
        lb_name: &str,
        pool: &model::BackendPool,
    ) -> Result<()>;

    /// Remove members whose VM set matches `should_remove` from the cluster's
    /// pool of `lb`. Used when VM sets move between standard load balancers.
    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceRef,
        nodes: &[Node],
        should_remove: &VmSetFilter,
    ) -> Result<()>;

    /// Create the cluster's pool in `lb` if missing and detach nodes that are
    /// excluded from load balancers.
    async fn reconcile_backend_pools(&self, service: &ServiceRef, lb: &mut LoadBalancer) -> Result<PoolReconcile>;
}

// =============================================================================
// Naming
// =============================================================================

/// Name of the cluster's backend pool for a service.
pub fn backend_pool_name(config: &CloudConfig, service: &ServiceRef) -> String {
    if config.ipv6_dual_stack_enabled && service.ipv6 {
        format!("{}{}", config.cluster_name, ids::IPV6_POOL_SUFFIX)
    } else {
        config.cluster_name.clone()
    }
}

/// VM set fronted by a load balancer: the primary set for the cluster's own
/// load balancer, else the load-balancer name without its internal suffix.
pub fn map_load_balancer_name_to_vm_set(config: &CloudConfig, lb_name: &str) -> String {
    let name = strip_internal_suffix(lb_name);
    if name.eq_ignore_ascii_case(&config.cluster_name) {
        config.primary_vm_set_name().to_string()
    } else {
        name.to_string()
    }
}

fn strip_internal_suffix(lb_name: &str) -> &str {
    let cut = lb_name.len().saturating_sub(ids::INTERNAL_LB_SUFFIX.len());
    match lb_name.get(cut..) {
        Some(suffix) if suffix.eq_ignore_ascii_case(ids::INTERNAL_LB_SUFFIX) => &lb_name[..cut],
        _ => lb_name,
    }
}

/// Whether the service's pool is managed outside this cluster.
pub fn is_backend_pool_pre_configured(config: &CloudConfig, service: &ServiceRef) -> bool {
    match config.pre_configured_backend_pool_load_balancer_types.as_str() {
        "all" => true,
        "internal" => service.internal,
        "external" => !service.internal,
        _ => false,
    }
}

/// Append an empty cluster pool to `lb`. A pre-configured pool that does not
/// exist is ignored, so the result is never pre-configured.
fn add_backend_pool(config: &CloudConfig, lb: &mut LoadBalancer, service: &ServiceRef, pre_configured: bool) {
    let name = backend_pool_name(config, service);
    if pre_configured {
        info!(
            "backend pool of service {} is pre-configured ({}) but {} does not exist in {}, creating it",
            service, config.pre_configured_backend_pool_load_balancer_types, name, lb.name
        );
    }
    lb.backend_pools.push(model::BackendPool {
        id: ids::backend_pool_id(
            &config.subscription_id,
            config.load_balancer_resource_group(),
            &lb.name,
            &name,
        ),
        name,
        ..Default::default()
    });
}

/// Find the cluster pool of `lb`; logs the unmanaged ones.
fn find_pool<'a>(lb: &'a mut LoadBalancer, name: &str, service: &ServiceRef) -> Option<&'a mut model::BackendPool> {
    let mut found = None;
    for pool in lb.backend_pools.iter_mut() {
        if pool.name.eq_ignore_ascii_case(name) {
            found = Some(pool);
            break;
        }
        debug!(
            "reconcile backend pools for service {}: found unmanaged backend pool {}",
            service, pool.name
        );
    }
    found
}

// =============================================================================
// Node IP configuration
// =============================================================================

/// Pool membership through NIC IP configurations.
pub struct NodeIpConfigPool {
    config: Arc<CloudConfig>,
    vm_set: Arc<dyn VmSet>,
    projection: Arc<NodeProjection>,
}

impl NodeIpConfigPool {
    pub fn new(config: Arc<CloudConfig>, vm_set: Arc<dyn VmSet>, projection: Arc<NodeProjection>) -> Self {
        Self {
            config,
            vm_set,
            projection,
        }
    }

    fn pool_id(&self, lb_name: &str, service: &ServiceRef) -> String {
        ids::backend_pool_id(
            &self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
            &backend_pool_name(&self.config, service),
        )
    }

    /// Node and VM-set name owning an IP configuration; unknown owners
    /// resolve to empty names.
    async fn owner(&self, ip_config_id: &str) -> Result<(String, String)> {
        match self.vm_set.get_node_name_by_ip_configuration_id(ip_config_id).await {
            Ok(owner) => Ok(owner),
            Err(e) if e.is_instance_not_found() => Ok((String::new(), String::new())),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BackendPool for NodeIpConfigPool {
    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
        _lb_name: &str,
        _pool: &model::BackendPool,
    ) -> Result<()> {
        self.vm_set
            .ensure_hosts_in_pool(service, nodes, backend_pool_id, vm_set_name)
            .await
    }

    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceRef,
        _nodes: &[Node],
        should_remove: &VmSetFilter,
    ) -> Result<()> {
        let pool_name = backend_pool_name(&self.config, service);
        let pool_id = self.pool_id(&lb.name, service);
        let lb_name = lb.name.clone();

        let mut removals: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(pool) = find_pool(lb, &pool_name, service) {
            info!("checking backend pool {} of load balancer {}", pool.name, lb_name);
            let mut kept = Vec::with_capacity(pool.ip_configuration_ids.len());
            for ip_config_id in std::mem::take(&mut pool.ip_configuration_ids) {
                let (_, vm_set_name) = self.owner(&ip_config_id).await?;
                if should_remove(vm_set_name.as_str()) {
                    info!("found unwanted vm set {}, decoupling it from load balancer {}", vm_set_name, lb_name);
                    removals.entry(vm_set_name).or_default().push(ip_config_id);
                } else {
                    kept.push(ip_config_id);
                }
            }
            pool.ip_configuration_ids = kept;
        }

        for (vm_set_name, ip_config_ids) in &removals {
            self.vm_set
                .ensure_backend_pool_deleted(service, &pool_id, vm_set_name, ip_config_ids, true)
                .await?;
        }
        if !removals.is_empty() {
            // Removing members rewrites the load balancer remotely.
            lb.etag = None;
        }
        Ok(())
    }

    async fn reconcile_backend_pools(&self, service: &ServiceRef, lb: &mut LoadBalancer) -> Result<PoolReconcile> {
        let pool_name = backend_pool_name(&self.config, service);
        let pool_id = self.pool_id(&lb.name, service);
        let vm_set_name = map_load_balancer_name_to_vm_set(&self.config, &lb.name);
        let lb_name = lb.name.clone();
        let pre_configured = is_backend_pool_pre_configured(&self.config, service);

        let Some(pool) = find_pool(lb, &pool_name, service) else {
            add_backend_pool(&self.config, lb, service, pre_configured);
            return Ok(PoolReconcile {
                pre_configured: false,
                changed: true,
            });
        };

        let mut excluded = Vec::new();
        for ip_config_id in &pool.ip_configuration_ids {
            let (node_name, _) = self.owner(ip_config_id).await?;
            if self.projection.should_exclude_from_load_balancer(&node_name).await? {
                info!(
                    "reconcile backend pools for service {}: found unwanted node {}, decoupling it from load balancer {}",
                    service, node_name, lb_name
                );
                excluded.push(ip_config_id.clone());
            }
        }
        if !excluded.is_empty() {
            self.vm_set
                .ensure_backend_pool_deleted(service, &pool_id, &vm_set_name, &excluded, false)
                .await?;
        }

        Ok(PoolReconcile {
            pre_configured,
            changed: false,
        })
    }
}

// =============================================================================
// Node IP
// =============================================================================

/// Pool membership through node IP addresses.
pub struct NodeIpPool {
    config: Arc<CloudConfig>,
    vm_set: Arc<dyn VmSet>,
    network: Arc<dyn NetworkClient>,
    projection: Arc<NodeProjection>,
}

impl NodeIpPool {
    pub fn new(
        config: Arc<CloudConfig>,
        vm_set: Arc<dyn VmSet>,
        network: Arc<dyn NetworkClient>,
        projection: Arc<NodeProjection>,
    ) -> Self {
        Self {
            config,
            vm_set,
            network,
            projection,
        }
    }

    fn vnet_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.config.subscription_id,
            self.config.vnet_resource_group(),
            self.config.vnet_name
        )
    }

    async fn write_pool(&self, lb_name: &str, pool: model::BackendPool) -> Result<()> {
        let name = pool.name.clone();
        self.network
            .create_or_update_backend_pool(self.config.load_balancer_resource_group(), lb_name, pool)
            .await
            .map_err(|e| match e {
                CloudError::Unexpected { status, message } => CloudError::Unexpected {
                    status,
                    message: format!("failed to update backend pool {name} of {lb_name}: {message}"),
                },
                e => e,
            })
    }

    /// Whether a node may join the load balancer named `lb_name`.
    async fn node_fits_load_balancer(&self, node: &Node, lb_name: &str) -> Result<bool> {
        if self.config.use_single_standard_load_balancer() {
            return Ok(true);
        }
        let node_vm_set = self.vm_set.get_node_vm_set_name(node).await?;
        if node_vm_set.eq_ignore_ascii_case(&map_load_balancer_name_to_vm_set(&self.config, lb_name)) {
            return Ok(true);
        }
        let primary_lb = strip_internal_suffix(lb_name).eq_ignore_ascii_case(&self.config.cluster_name);
        Ok(primary_lb
            && self.config.use_standard_load_balancer()
            && self
                .config
                .vm_sets_sharing_primary_slb()
                .contains(&node_vm_set.to_lowercase()))
    }
}

/// Drop addresses listed in `ips`. Returns true if any was removed.
fn remove_addresses(pool: &mut model::BackendPool, ips: &BTreeSet<String>) -> bool {
    let before = pool.addresses.len();
    let name = &pool.name;
    pool.addresses.retain(|a| {
        let remove = ips.contains(&a.ip_address);
        if remove {
            debug!("removing {} from backend pool {}", a.ip_address, name);
        }
        !remove
    });
    pool.addresses.len() != before
}

#[async_trait]
impl BackendPool for NodeIpPool {
    async fn ensure_hosts_in_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        _backend_pool_id: &str,
        _vm_set_name: &str,
        lb_name: &str,
        pool: &model::BackendPool,
    ) -> Result<()> {
        let pool_name = backend_pool_name(&self.config, service);
        if !pool.name.eq_ignore_ascii_case(&pool_name) {
            return Ok(());
        }

        let mut pool = pool.clone();
        let mut existing: BTreeSet<String> = pool.addresses.iter().map(|a| a.ip_address.clone()).collect();
        let vnet_id = self.vnet_id();
        let mut changed = false;

        for node in nodes {
            if node.is_control_plane()
                && (!self.config.use_standard_load_balancer() || self.config.exclude_master_nodes_from_standard_lb())
            {
                debug!(node = %node.name, "skipping control plane node");
                continue;
            }
            if !self.node_fits_load_balancer(node, lb_name).await? {
                debug!(node = %node.name, "skipping node, its vm set is not fronted by {}", lb_name);
                continue;
            }
            let Some(ip) = node.private_ip_for(service.ipv6) else {
                warn!(node = %node.name, "node has no private IP (IPv6={}), skipping", service.ipv6);
                continue;
            };
            if !existing.insert(ip.to_string()) {
                continue;
            }

            let name = if ip.contains(':') {
                format!("{}-ipv6", node.name)
            } else {
                node.name.clone()
            };
            debug!("adding {} with IP address {} to backend pool {}", name, ip, pool_name);
            pool.addresses.push(BackendAddress {
                name,
                ip_address: ip.to_string(),
                virtual_network_id: Some(vnet_id.clone()),
            });
            changed = true;
        }

        if changed {
            info!("updating backend pool {} of load balancer {}", pool_name, lb_name);
            self.write_pool(lb_name, pool).await?;
        }
        Ok(())
    }

    async fn cleanup_vm_set_from_backend_pool_by_condition(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceRef,
        nodes: &[Node],
        should_remove: &VmSetFilter,
    ) -> Result<()> {
        let pool_name = backend_pool_name(&self.config, service);

        let mut unwanted = BTreeSet::new();
        for node in nodes {
            let vm_set_name = self.vm_set.get_node_vm_set_name(node).await?;
            if !should_remove(vm_set_name.as_str()) {
                continue;
            }
            if let Some(ip) = node.private_ip_for(service.ipv6) {
                unwanted.insert(ip.to_string());
            }
        }

        let lb_name = lb.name.clone();
        let Some(pool) = find_pool(lb, &pool_name, service) else {
            return Ok(());
        };
        if remove_addresses(pool, &unwanted) {
            info!("updating load balancer {}: removed addresses {:?}", lb_name, unwanted);
            let pool = pool.clone();
            self.write_pool(&lb_name, pool).await?;
        }
        Ok(())
    }

    async fn reconcile_backend_pools(&self, service: &ServiceRef, lb: &mut LoadBalancer) -> Result<PoolReconcile> {
        let pool_name = backend_pool_name(&self.config, service);
        let pre_configured = is_backend_pool_pre_configured(&self.config, service);
        let lb_name = lb.name.clone();

        if find_pool(lb, &pool_name, service).is_none() {
            add_backend_pool(&self.config, lb, service, pre_configured);
            return Ok(PoolReconcile {
                pre_configured: false,
                changed: true,
            });
        }

        let mut unwanted = BTreeSet::new();
        for node_name in self.projection.excluded_nodes().await? {
            for ip in self.projection.node_private_ips(&node_name).await? {
                info!(
                    "reconcile backend pools for service {}: found unwanted node IP {}, decoupling it from load balancer {}",
                    service, ip, lb_name
                );
                unwanted.insert(ip);
            }
        }

        if let Some(pool) = find_pool(lb, &pool_name, service)
            && remove_addresses(pool, &unwanted)
        {
            let pool = pool.clone();
            self.write_pool(&lb_name, pool).await?;
        }

        Ok(PoolReconcile {
            pre_configured,
            changed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancerSku, VmType};

    fn make_config() -> CloudConfig {
        CloudConfig {
            vm_type: VmType::Vmss,
            cluster_name: "kubernetes".into(),
            primary_scale_set_name: "pool".into(),
            subscription_id: "sub".into(),
            resource_group: "rg".into(),
            load_balancer_sku: LoadBalancerSku::Standard,
            ..Default::default()
        }
    }

    fn make_service(internal: bool, ipv6: bool) -> ServiceRef {
        ServiceRef {
            namespace: "default".into(),
            name: "web".into(),
            internal,
            ipv6,
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_pool_name() {
        let mut config = make_config();
        assert_eq!(backend_pool_name(&config, &make_service(false, true)), "kubernetes");
        config.ipv6_dual_stack_enabled = true;
        assert_eq!(backend_pool_name(&config, &make_service(false, true)), "kubernetes-IPv6");
        assert_eq!(backend_pool_name(&config, &make_service(false, false)), "kubernetes");
    }

    #[test]
    fn test_map_load_balancer_name_to_vm_set() {
        let config = make_config();
        assert_eq!(map_load_balancer_name_to_vm_set(&config, "kubernetes"), "pool");
        assert_eq!(map_load_balancer_name_to_vm_set(&config, "kubernetes-internal"), "pool");
        assert_eq!(map_load_balancer_name_to_vm_set(&config, "pool-b-internal"), "pool-b");
        assert_eq!(map_load_balancer_name_to_vm_set(&config, "pool-b"), "pool-b");
    }

    #[test]
    fn test_is_backend_pool_pre_configured() {
        let mut config = make_config();
        assert!(!is_backend_pool_pre_configured(&config, &make_service(true, false)));

        config.pre_configured_backend_pool_load_balancer_types = "internal".into();
        assert!(is_backend_pool_pre_configured(&config, &make_service(true, false)));
        assert!(!is_backend_pool_pre_configured(&config, &make_service(false, false)));

        config.pre_configured_backend_pool_load_balancer_types = "external".into();
        assert!(is_backend_pool_pre_configured(&config, &make_service(false, false)));

        config.pre_configured_backend_pool_load_balancer_types = "all".into();
        assert!(is_backend_pool_pre_configured(&config, &make_service(true, false)));
    }

    #[test]
    fn test_add_backend_pool() {
        let config = make_config();
        let mut lb = LoadBalancer {
            name: "kubernetes".into(),
            ..Default::default()
        };
        add_backend_pool(&config, &mut lb, &make_service(false, false), true);
        assert_eq!(lb.backend_pools.len(), 1);
        assert_eq!(lb.backend_pools[0].name, "kubernetes");
        assert_eq!(
            lb.backend_pools[0].id,
            ids::backend_pool_id("sub", "rg", "kubernetes", "kubernetes")
        );
    }

    #[test]
    fn test_remove_addresses() {
        let mut pool = model::BackendPool {
            name: "kubernetes".into(),
            addresses: vec![
                BackendAddress {
                    name: "a".into(),
                    ip_address: "10.0.0.4".into(),
                    virtual_network_id: None,
                },
                BackendAddress {
                    name: "b".into(),
                    ip_address: "10.0.0.5".into(),
                    virtual_network_id: None,
                },
            ],
            ..Default::default()
        };
        let ips: BTreeSet<String> = ["10.0.0.5".to_string()].into();
        assert!(remove_addresses(&mut pool, &ips));
        assert!(!remove_addresses(&mut pool, &ips));
        assert_eq!(pool.addresses.len(), 1);
    }
}
