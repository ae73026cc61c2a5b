//! Control-plane client traits.
//!
//! These traits abstract the remote compute and network APIs so the caches and
//! VM-set backends work with domain objects instead of HTTP requests. Errors are
//! already classified into [`crate::error::CloudError`] kinds.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::model::{
    BackendPool, Disk, LoadBalancer, NetworkInterface, ScaleSet, VirtualMachine, VmUpdate,
};

/// Completion of a long-running VM update.
///
/// The update has been accepted by the control plane when the future is
/// returned; awaiting it waits for the operation to finish.
pub type UpdateFuture = BoxFuture<'static, Result<()>>;

/// Compute API: scale sets, VMs and disks.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// List scale sets in a resource group.
    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<ScaleSet>>;

    /// Get a scale set.
    async fn get_scale_set(&self, resource_group: &str, name: &str) -> Result<ScaleSet>;

    /// Replace a scale set's VM template.
    async fn create_or_update_scale_set(
        &self,
        resource_group: &str,
        name: &str,
        scale_set: ScaleSet,
    ) -> Result<()>;

    /// List scale-set instances with their instance view expanded.
    async fn list_scale_set_vms(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<VirtualMachine>>;

    /// Start an update of a scale-set instance.
    async fn begin_update_scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        update: VmUpdate,
    ) -> Result<UpdateFuture>;

    /// List standalone VMs (availability-set and flex members) in a resource group.
    async fn list_vms(&self, resource_group: &str) -> Result<Vec<VirtualMachine>>;

    /// Get a standalone VM with its instance view.
    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<VirtualMachine>;

    /// Start an update of a standalone VM.
    async fn begin_update_vm(
        &self,
        resource_group: &str,
        name: &str,
        update: VmUpdate,
    ) -> Result<UpdateFuture>;

    /// Get a managed disk.
    async fn get_disk(&self, resource_group: &str, name: &str) -> Result<Disk>;
}

/// Network API: interfaces and load balancers.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Get a standalone NIC.
    async fn get_interface(&self, resource_group: &str, name: &str) -> Result<NetworkInterface>;

    /// Get the NIC of a scale-set instance.
    async fn get_scale_set_interface(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        name: &str,
    ) -> Result<NetworkInterface>;

    /// Replace a standalone NIC.
    async fn create_or_update_interface(
        &self,
        resource_group: &str,
        name: &str,
        nic: NetworkInterface,
    ) -> Result<()>;

    /// Get a load balancer.
    async fn get_load_balancer(&self, resource_group: &str, name: &str) -> Result<LoadBalancer>;

    /// Create or replace a backend pool of a load balancer.
    async fn create_or_update_backend_pool(
        &self,
        resource_group: &str,
        load_balancer: &str,
        pool: BackendPool,
    ) -> Result<()>;
}
