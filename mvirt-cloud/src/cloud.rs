//! The cloud facade.
//!
//! [`Cloud`] wires configuration, control-plane clients, the node projection,
//! the VM-set backend, the disk coordinator and the backend-pool mode together.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backendpool::{
    BackendPool, NodeIpConfigPool, NodeIpPool, PoolReconcile, backend_pool_name,
    map_load_balancer_name_to_vm_set,
};
use crate::client::{ComputeClient, NetworkClient};
use crate::config::{BackendPoolType, CloudConfig, VmType};
use crate::disk::DiskCoordinator;
use crate::error::{CloudError, Result};
use crate::model::{LoadBalancer, Node, ServiceRef, VmSetKind};
use crate::nodes::{NodeEvent, NodeProjection};
use crate::vmset::{StandaloneVmSet, UniformVmSet, VmSet};

pub struct Cloud {
    config: Arc<CloudConfig>,
    network: Arc<dyn NetworkClient>,
    projection: Arc<NodeProjection>,
    vm_set: Arc<dyn VmSet>,
    disks: DiskCoordinator,
    backend_pool: Box<dyn BackendPool>,
}

impl Cloud {
    /// Validate `config` and build the components it selects.
    pub fn new(
        config: CloudConfig,
        compute: Arc<dyn ComputeClient>,
        network: Arc<dyn NetworkClient>,
    ) -> Result<Self> {
        let config = Arc::new(config.validate()?);
        let projection = Arc::new(NodeProjection::new(
            config.resource_group.clone(),
            config.location.clone(),
        ));

        let vm_set: Arc<dyn VmSet> = match config.vm_type {
            VmType::Vmss => Arc::new(UniformVmSet::new(
                config.clone(),
                compute.clone(),
                network.clone(),
                projection.clone(),
            )),
            VmType::VmssFlex => Arc::new(StandaloneVmSet::new(
                VmSetKind::FlexScaleSet,
                config.clone(),
                compute.clone(),
                network.clone(),
                projection.clone(),
            )),
            VmType::Standard => Arc::new(StandaloneVmSet::new(
                VmSetKind::AvailabilitySet,
                config.clone(),
                compute.clone(),
                network.clone(),
                projection.clone(),
            )),
        };

        let backend_pool: Box<dyn BackendPool> = match config.load_balancer_backend_pool_configuration_type {
            BackendPoolType::NodeIp => Box::new(NodeIpPool::new(
                config.clone(),
                vm_set.clone(),
                network.clone(),
                projection.clone(),
            )),
            BackendPoolType::NodeIpConfiguration | BackendPoolType::PodIp => Box::new(NodeIpConfigPool::new(
                config.clone(),
                vm_set.clone(),
                projection.clone(),
            )),
        };

        info!(
            vm_type = ?config.vm_type,
            sku = ?config.load_balancer_sku,
            pool_type = ?config.load_balancer_backend_pool_configuration_type,
            "Cloud initialized for resource group {}",
            config.resource_group
        );

        Ok(Self {
            disks: DiskCoordinator::new(vm_set.clone(), &config),
            config,
            network,
            projection,
            vm_set,
            backend_pool,
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn projection(&self) -> &Arc<NodeProjection> {
        &self.projection
    }

    pub fn vm_set(&self) -> &Arc<dyn VmSet> {
        &self.vm_set
    }

    pub fn disks(&self) -> &DiskCoordinator {
        &self.disks
    }

    pub fn backend_pool(&self) -> &dyn BackendPool {
        self.backend_pool.as_ref()
    }

    /// Feed a node informer event into the projection. A deleted node's
    /// cached VM document is dropped as well.
    pub async fn handle_node_event(&self, event: &NodeEvent) {
        debug!(node = %event.node_name(), "node event");
        self.projection.handle(event).await;
        if let NodeEvent::Deleted { node } = event {
            self.vm_set.delete_cache_for_node(&node.name);
        }
    }

    async fn load_balancer(&self, lb_name: &str) -> Result<LoadBalancer> {
        self.network
            .get_load_balancer(self.config.load_balancer_resource_group(), lb_name)
            .await
    }

    /// Bring the cluster pool of `lb_name` up to date for a service: create
    /// it if missing, detach excluded nodes and add `nodes`. Pre-configured
    /// pools are left alone after reconciliation.
    pub async fn ensure_backend_pool(
        &self,
        service: &ServiceRef,
        nodes: &[Node],
        lb_name: &str,
    ) -> Result<PoolReconcile> {
        let mut lb = self.load_balancer(lb_name).await?;
        let result = self.backend_pool.reconcile_backend_pools(service, &mut lb).await?;

        let pool_name = backend_pool_name(&self.config, service);
        let pool = lb
            .backend_pools
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&pool_name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("backend pool {pool_name} of {lb_name}")))?;

        if result.changed {
            info!("creating backend pool {} of load balancer {}", pool_name, lb_name);
            self.network
                .create_or_update_backend_pool(self.config.load_balancer_resource_group(), lb_name, pool.clone())
                .await?;
        }
        if result.pre_configured {
            debug!("backend pool {} is pre-configured, not adding hosts", pool_name);
            return Ok(result);
        }

        let vm_set_name = map_load_balancer_name_to_vm_set(&self.config, lb_name);
        self.backend_pool
            .ensure_hosts_in_pool(service, nodes, &pool.id, &vm_set_name, lb_name, &pool)
            .await?;
        Ok(result)
    }

    /// Remove every member of the cluster pool of `lb_name`. Returns true if
    /// anything was updated.
    pub async fn ensure_backend_pool_deleted(&self, service: &ServiceRef, lb_name: &str) -> Result<bool> {
        let lb = self.load_balancer(lb_name).await?;
        let pool_name = backend_pool_name(&self.config, service);
        let Some(pool) = lb
            .backend_pools
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(&pool_name))
        else {
            return Ok(false);
        };

        match self.config.load_balancer_backend_pool_configuration_type {
            BackendPoolType::NodeIp => {
                if pool.addresses.is_empty() {
                    return Ok(false);
                }
                let mut pool = pool;
                pool.addresses.clear();
                self.network
                    .create_or_update_backend_pool(self.config.load_balancer_resource_group(), lb_name, pool)
                    .await?;
                Ok(true)
            }
            BackendPoolType::NodeIpConfiguration | BackendPoolType::PodIp => {
                let vm_set_name = map_load_balancer_name_to_vm_set(&self.config, lb_name);
                self.vm_set
                    .ensure_backend_pool_deleted(service, &pool.id, &vm_set_name, &pool.ip_configuration_ids, true)
                    .await
            }
        }
    }
}
