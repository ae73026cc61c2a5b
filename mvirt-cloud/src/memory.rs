//! In-memory control plane.
//!
//! Implements [`ComputeClient`] and [`NetworkClient`] over plain maps so the
//! reconciliation core can be exercised without a cloud. Every call is counted,
//! VM updates are recorded, and failures can be scripted per update.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ComputeClient, NetworkClient, UpdateFuture};
use crate::error::{CloudError, Result};
use crate::ids;
use crate::model::{
    BackendPool, Disk, DiskState, LoadBalancer, NetworkInterface, ScaleSet, VirtualMachine,
    VmUpdate,
};

type Key = (String, String);

fn key(resource_group: &str, name: &str) -> Key {
    (resource_group.to_lowercase(), name.to_lowercase())
}

/// Target of a recorded VM update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatedVm {
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

/// A VM update issued against the control plane.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub target: UpdatedVm,
    pub update: VmUpdate,
}

#[derive(Default)]
struct MemoryState {
    resource_groups: HashSet<String>,
    scale_sets: HashMap<Key, ScaleSet>,
    /// (rg, scale set) -> instance id -> VM
    scale_set_vms: HashMap<Key, BTreeMap<String, VirtualMachine>>,
    vms: HashMap<Key, VirtualMachine>,
    disks: HashMap<Key, Disk>,
    interfaces: HashMap<Key, NetworkInterface>,
    /// (rg, "<scale set>/<instance>/<nic>") -> NIC
    scale_set_interfaces: HashMap<Key, NetworkInterface>,
    load_balancers: HashMap<Key, LoadBalancer>,

    calls: HashMap<&'static str, usize>,
    updates: Vec<RecordedUpdate>,
    update_failures: VecDeque<CloudError>,
    list_failures: VecDeque<CloudError>,
    update_latency: Duration,
}

impl MemoryState {
    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn check_resource_group(&self, resource_group: &str) -> Result<()> {
        if self.resource_groups.contains(&resource_group.to_lowercase()) {
            Ok(())
        } else {
            Err(CloudError::NotFound(format!(
                "ResourceGroupNotFound: resource group {resource_group} could not be found"
            )))
        }
    }

    fn vm_mut(&mut self, target: &UpdatedVm) -> Result<&mut VirtualMachine> {
        match target {
            UpdatedVm::ScaleSetVm {
                resource_group,
                scale_set,
                instance_id,
            } => self
                .scale_set_vms
                .get_mut(&key(resource_group, scale_set))
                .and_then(|instances| instances.get_mut(instance_id))
                .ok_or_else(|| {
                    CloudError::InstanceNotFound(format!(
                        "The provided instanceId {instance_id} is not an active Virtual Machine Scale Set VM instanceId."
                    ))
                }),
            UpdatedVm::Vm {
                resource_group,
                name,
            } => self
                .vms
                .get_mut(&key(resource_group, name))
                .ok_or_else(|| CloudError::NotFound(format!("virtual machine {name} not found"))),
        }
    }

    /// Apply a committed update: disks flagged for detach leave the VM and
    /// every managed disk's back-reference follows the new layout.
    fn apply(&mut self, target: &UpdatedVm, update: &VmUpdate) -> Result<()> {
        let vm = self.vm_mut(target)?;
        let vm_id = vm.id.clone();
        let mut attached = Vec::new();
        let mut detached = Vec::new();

        // Any committed update also commits pending deferred detaches.
        let disks = update.data_disks.as_ref().unwrap_or(&vm.data_disks).clone();
        let before: Vec<String> = vm
            .data_disks
            .iter()
            .filter_map(|d| d.managed_disk_id.clone())
            .collect();
        vm.data_disks = disks.into_iter().filter(|d| !d.to_be_detached).collect();
        let after: Vec<String> = vm
            .data_disks
            .iter()
            .filter_map(|d| d.managed_disk_id.clone())
            .collect();

        for id in &after {
            if !before.iter().any(|b| b.eq_ignore_ascii_case(id)) {
                attached.push(id.clone());
            }
        }
        for id in &before {
            if !after.iter().any(|a| a.eq_ignore_ascii_case(id)) {
                detached.push(id.clone());
            }
        }

        if let Some(configurations) = &update.network_configurations {
            let profile = vm.network_profile.get_or_insert_with(Default::default);
            profile.configurations = configurations.clone();
        }

        for id in attached {
            if let Some(disk) = self.disk_by_id_mut(&id) {
                disk.managed_by = Some(vm_id.clone());
                disk.state = DiskState::Attached;
            }
        }
        for id in detached {
            if let Some(disk) = self.disk_by_id_mut(&id) {
                disk.managed_by = None;
                disk.state = DiskState::Unattached;
            }
        }
        Ok(())
    }

    fn disk_by_id_mut(&mut self, id: &str) -> Option<&mut Disk> {
        let parsed = ids::parse_managed_disk_id(id).ok()?;
        self.disks.get_mut(&key(&parsed.resource_group, &parsed.name))
    }
}

/// A control plane held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    match state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn add_resource_group(&self, resource_group: &str) {
        self.state()
            .resource_groups
            .insert(resource_group.to_lowercase());
    }

    /// Make listing calls in `resource_group` fail with not-found.
    pub fn remove_resource_group(&self, resource_group: &str) {
        let mut state = self.state();
        let rg = resource_group.to_lowercase();
        state.resource_groups.remove(&rg);
        state.scale_sets.retain(|(group, _), _| *group != rg);
        state.scale_set_vms.retain(|(group, _), _| *group != rg);
        state.vms.retain(|(group, _), _| *group != rg);
    }

    pub fn put_scale_set(&self, scale_set: ScaleSet) {
        let mut state = self.state();
        state
            .resource_groups
            .insert(scale_set.resource_group.to_lowercase());
        let k = key(&scale_set.resource_group, &scale_set.name);
        state.scale_set_vms.entry(k.clone()).or_default();
        state.scale_sets.insert(k, scale_set);
    }

    pub fn remove_scale_set(&self, resource_group: &str, name: &str) {
        let mut state = self.state();
        let k = key(resource_group, name);
        state.scale_sets.remove(&k);
        state.scale_set_vms.remove(&k);
    }

    /// Add or replace a scale-set instance; `vm.instance_id` must be set.
    pub fn put_scale_set_vm(&self, resource_group: &str, scale_set: &str, vm: VirtualMachine) {
        let instance_id = vm.instance_id.clone().unwrap_or_default();
        self.state()
            .scale_set_vms
            .entry(key(resource_group, scale_set))
            .or_default()
            .insert(instance_id, vm);
    }

    pub fn remove_scale_set_vm(&self, resource_group: &str, scale_set: &str, instance_id: &str) {
        if let Some(instances) = self
            .state()
            .scale_set_vms
            .get_mut(&key(resource_group, scale_set))
        {
            instances.remove(instance_id);
        }
    }

    pub fn put_vm(&self, resource_group: &str, vm: VirtualMachine) {
        let mut state = self.state();
        state.resource_groups.insert(resource_group.to_lowercase());
        state.vms.insert(key(resource_group, &vm.name), vm);
    }

    pub fn remove_vm(&self, resource_group: &str, name: &str) {
        self.state().vms.remove(&key(resource_group, name));
    }

    pub fn put_disk(&self, resource_group: &str, disk: Disk) {
        self.state().disks.insert(key(resource_group, &disk.name), disk);
    }

    pub fn put_interface(&self, resource_group: &str, nic: NetworkInterface) {
        self.state()
            .interfaces
            .insert(key(resource_group, &nic.name), nic);
    }

    pub fn put_scale_set_interface(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        nic: NetworkInterface,
    ) {
        let name = format!("{scale_set}/{instance_id}/{}", nic.name);
        self.state()
            .scale_set_interfaces
            .insert(key(resource_group, &name), nic);
    }

    pub fn put_load_balancer(&self, resource_group: &str, lb: LoadBalancer) {
        self.state()
            .load_balancers
            .insert(key(resource_group, &lb.name), lb);
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// The next VM update completes with `err`. Updates failing with a 2xx
    /// status are still applied.
    pub fn fail_next_update(&self, err: CloudError) {
        self.state().update_failures.push_back(err);
    }

    /// The next VM listing fails with `err`.
    pub fn fail_next_list(&self, err: CloudError) {
        self.state().list_failures.push_back(err);
    }

    /// Delay between accepting a VM update and its completion.
    pub fn set_update_latency(&self, latency: Duration) {
        self.state().update_latency = latency;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or_default()
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.state().updates.clone()
    }

    pub fn scale_set(&self, resource_group: &str, name: &str) -> Option<ScaleSet> {
        self.state().scale_sets.get(&key(resource_group, name)).cloned()
    }

    pub fn scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
    ) -> Option<VirtualMachine> {
        self.state()
            .scale_set_vms
            .get(&key(resource_group, scale_set))
            .and_then(|instances| instances.get(instance_id))
            .cloned()
    }

    pub fn vm(&self, resource_group: &str, name: &str) -> Option<VirtualMachine> {
        self.state().vms.get(&key(resource_group, name)).cloned()
    }

    pub fn disk(&self, resource_group: &str, name: &str) -> Option<Disk> {
        self.state().disks.get(&key(resource_group, name)).cloned()
    }

    pub fn interface(&self, resource_group: &str, name: &str) -> Option<NetworkInterface> {
        self.state().interfaces.get(&key(resource_group, name)).cloned()
    }

    pub fn load_balancer(&self, resource_group: &str, name: &str) -> Option<LoadBalancer> {
        self.state()
            .load_balancers
            .get(&key(resource_group, name))
            .cloned()
    }

    fn begin_update(&self, target: UpdatedVm, update: VmUpdate) -> Result<UpdateFuture> {
        let (latency, failure) = {
            let mut state = self.state();
            state.count("begin_update");
            state.vm_mut(&target)?;
            state.updates.push(RecordedUpdate {
                target: target.clone(),
                update: update.clone(),
            });
            (state.update_latency, state.update_failures.pop_front())
        };

        let state = self.state.clone();
        Ok(Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut state = lock(&state);
            match failure {
                Some(err) if err.is_accepted() => {
                    state.apply(&target, &update)?;
                    Err(err)
                }
                Some(err) => Err(err),
                None => state.apply(&target, &update),
            }
        }))
    }
}

#[async_trait]
impl ComputeClient for MemoryCloud {
    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<ScaleSet>> {
        let mut state = self.state();
        state.count("list_scale_sets");
        state.check_resource_group(resource_group)?;
        let rg = resource_group.to_lowercase();
        Ok(state
            .scale_sets
            .iter()
            .filter(|((group, _), _)| *group == rg)
            .map(|(_, ss)| ss.clone())
            .collect())
    }

    async fn get_scale_set(&self, resource_group: &str, name: &str) -> Result<ScaleSet> {
        let mut state = self.state();
        state.count("get_scale_set");
        state
            .scale_sets
            .get(&key(resource_group, name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("scale set {name} not found")))
    }

    async fn create_or_update_scale_set(
        &self,
        resource_group: &str,
        name: &str,
        scale_set: ScaleSet,
    ) -> Result<()> {
        let mut state = self.state();
        state.count("create_or_update_scale_set");
        state.check_resource_group(resource_group)?;
        state.scale_sets.insert(key(resource_group, name), scale_set);
        Ok(())
    }

    async fn list_scale_set_vms(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<VirtualMachine>> {
        let mut state = self.state();
        state.count("list_scale_set_vms");
        state
            .scale_set_vms
            .get(&key(resource_group, scale_set))
            .map(|instances| instances.values().cloned().collect())
            .ok_or_else(|| CloudError::NotFound(format!("scale set {scale_set} not found")))
    }

    async fn begin_update_scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        update: VmUpdate,
    ) -> Result<UpdateFuture> {
        self.begin_update(
            UpdatedVm::ScaleSetVm {
                resource_group: resource_group.to_string(),
                scale_set: scale_set.to_string(),
                instance_id: instance_id.to_string(),
            },
            update,
        )
    }

    async fn list_vms(&self, resource_group: &str) -> Result<Vec<VirtualMachine>> {
        let mut state = self.state();
        state.count("list_vms");
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        state.check_resource_group(resource_group)?;
        let rg = resource_group.to_lowercase();
        Ok(state
            .vms
            .iter()
            .filter(|((group, _), _)| *group == rg)
            .map(|(_, vm)| vm.clone())
            .collect())
    }

    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<VirtualMachine> {
        let mut state = self.state();
        state.count("get_vm");
        state
            .vms
            .get(&key(resource_group, name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("virtual machine {name} not found")))
    }

    async fn begin_update_vm(
        &self,
        resource_group: &str,
        name: &str,
        update: VmUpdate,
    ) -> Result<UpdateFuture> {
        self.begin_update(
            UpdatedVm::Vm {
                resource_group: resource_group.to_string(),
                name: name.to_string(),
            },
            update,
        )
    }

    async fn get_disk(&self, resource_group: &str, name: &str) -> Result<Disk> {
        let mut state = self.state();
        state.count("get_disk");
        state
            .disks
            .get(&key(resource_group, name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("disk {name} not found")))
    }
}

#[async_trait]
impl NetworkClient for MemoryCloud {
    async fn get_interface(&self, resource_group: &str, name: &str) -> Result<NetworkInterface> {
        let mut state = self.state();
        state.count("get_interface");
        state
            .interfaces
            .get(&key(resource_group, name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("network interface {name} not found")))
    }

    async fn get_scale_set_interface(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
        name: &str,
    ) -> Result<NetworkInterface> {
        let mut state = self.state();
        state.count("get_scale_set_interface");
        let path = format!("{scale_set}/{instance_id}/{name}");
        state
            .scale_set_interfaces
            .get(&key(resource_group, &path))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("network interface {path} not found")))
    }

    async fn create_or_update_interface(
        &self,
        resource_group: &str,
        name: &str,
        nic: NetworkInterface,
    ) -> Result<()> {
        let mut state = self.state();
        state.count("create_or_update_interface");
        state.interfaces.insert(key(resource_group, name), nic);
        Ok(())
    }

    async fn get_load_balancer(&self, resource_group: &str, name: &str) -> Result<LoadBalancer> {
        let mut state = self.state();
        state.count("get_load_balancer");
        state
            .load_balancers
            .get(&key(resource_group, name))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {name} not found")))
    }

    async fn create_or_update_backend_pool(
        &self,
        resource_group: &str,
        load_balancer: &str,
        pool: BackendPool,
    ) -> Result<()> {
        let mut state = self.state();
        state.count("create_or_update_backend_pool");
        let lb = state
            .load_balancers
            .get_mut(&key(resource_group, load_balancer))
            .ok_or_else(|| {
                CloudError::NotFound(format!("load balancer {load_balancer} not found"))
            })?;
        match lb
            .backend_pools
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&pool.name))
        {
            Some(existing) => *existing = pool,
            None => lb.backend_pools.push(pool),
        }
        Ok(())
    }
}
