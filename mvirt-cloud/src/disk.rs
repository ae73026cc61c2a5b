//! Attach/detach coordinator.
//!
//! Disk attach and detach requests for one node are queued, coalesced into a
//! single VM update and executed under a per-node lock. LUNs are allocated
//! against the node's current data-disk list right before the update starts.
//! A batch that releases the lock early stays visible to the callers whose
//! disks it carries until its update has finished.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::ReadMode;
use crate::config::CloudConfig;
use crate::error::{CloudError, Result};
use crate::lockmap::LockMap;
use crate::model::{CachingMode, DataDisk, Disk, DiskState};
use crate::ratelimit::TokenBucket;
use crate::vmset::{AttachOptions, VmSet};

/// LUNs are allocated from `0..MAX_LUN`.
pub const MAX_LUN: i32 = 64;

/// Disks this large or larger cannot use host caching.
pub const DISK_CACHING_LIMIT_GB: i32 = 4096;

type Queue<V> = Mutex<HashMap<String, BTreeMap<String, V>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Add an entry to a node's queue; returns the queue length after insertion.
fn enqueue<V>(queue: &Queue<V>, node: &str, disk_uri: &str, value: V) -> usize {
    let mut queue = lock(queue);
    let pending = queue.entry(node.to_string()).or_default();
    pending.insert(disk_uri.to_string(), value);
    pending.len()
}

/// Take everything queued for a node.
fn take<V>(queue: &Queue<V>, node: &str) -> BTreeMap<String, V> {
    lock(queue).remove(node).unwrap_or_default()
}

/// Drop one entry from a node's queue.
fn withdraw<V>(queue: &Queue<V>, node: &str, disk_uri: &str) {
    let mut queue = lock(queue);
    if let Some(pending) = queue.get_mut(node) {
        pending.remove(disk_uri);
        if pending.is_empty() {
            queue.remove(node);
        }
    }
}

/// Result of an attach batch; `None` while its VM update is running.
type Outcome = Option<Result<()>>;

/// Disks carried by running attach batches, per node and disk URI.
type InFlightMap = Mutex<HashMap<String, HashMap<String, InFlight>>>;

/// A disk whose LUN was assigned by a running attach batch.
#[derive(Clone)]
struct InFlight {
    lun: i32,
    done: watch::Receiver<Outcome>,
}

impl InFlight {
    fn find(in_flight: &InFlightMap, node: &str, disk_uri: &str) -> Option<Self> {
        lock(in_flight).get(node)?.get(disk_uri).cloned()
    }

    /// LUNs held by running batches on a node.
    fn luns(in_flight: &InFlightMap, node: &str) -> Vec<i32> {
        lock(in_flight)
            .get(node)
            .map(|entries| entries.values().map(|entry| entry.lun).collect())
            .unwrap_or_default()
    }

    /// Wait for the batch carrying this disk to finish.
    async fn wait(mut self) -> Result<()> {
        let outcome = match self.done.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(CloudError::unexpected("attach batch was abandoned before it finished")))
    }
}

/// Registration of a running attach batch. Its entries are withdrawn on drop.
struct InFlightBatch<'a> {
    in_flight: &'a InFlightMap,
    node: String,
    uris: Vec<String>,
    done: watch::Sender<Outcome>,
}

impl<'a> InFlightBatch<'a> {
    fn publish(in_flight: &'a InFlightMap, node: &str, batch: &BTreeMap<String, AttachOptions>) -> Self {
        let (done, receiver) = watch::channel(None);
        let mut map = lock(in_flight);
        let entries = map.entry(node.to_string()).or_default();
        for (uri, options) in batch {
            entries.insert(
                uri.clone(),
                InFlight {
                    lun: options.lun,
                    done: receiver.clone(),
                },
            );
        }
        Self {
            in_flight,
            node: node.to_string(),
            uris: batch.keys().cloned().collect(),
            done,
        }
    }

    fn finish(&self, outcome: &Result<()>) {
        self.done.send_replace(Some(outcome.clone()));
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        let mut map = lock(self.in_flight);
        if let Some(entries) = map.get_mut(&self.node) {
            for uri in &self.uris {
                entries.remove(uri);
            }
            if entries.is_empty() {
                map.remove(&self.node);
            }
        }
    }
}

/// Assign LUNs to the disks of an attach batch.
///
/// Disks already present in `existing` leave the batch. The remaining ones get
/// the lowest LUNs that are neither attached nor `reserved`, in key order.
/// Returns the LUN of `disk_uri`, or [`CloudError::LunNotFound`] if it is
/// neither attached nor part of the batch.
pub fn allocate_luns(
    existing: &[DataDisk],
    reserved: &[i32],
    batch: &mut BTreeMap<String, AttachOptions>,
    disk_uri: &str,
) -> Result<i32> {
    let mut used = [false; MAX_LUN as usize];
    let mut lun = None;

    for &taken in reserved {
        if let Some(slot) = usize::try_from(taken).ok().and_then(|i| used.get_mut(i)) {
            *slot = true;
        }
    }

    for disk in existing {
        if let Some(slot) = usize::try_from(disk.lun).ok().and_then(|i| used.get_mut(i)) {
            *slot = true;
        }
        if let Some(id) = disk.managed_disk_id.as_deref() {
            if id.eq_ignore_ascii_case(disk_uri) {
                lun = Some(disk.lun);
            }
            batch.retain(|uri, _| !uri.eq_ignore_ascii_case(id));
        }
    }

    for (uri, options) in batch.iter_mut() {
        let free = used.iter().position(|used| !used).ok_or_else(|| {
            CloudError::unexpected(format!("all LUNs are used, cannot attach disk {uri}"))
        })?;
        used[free] = true;
        options.lun = free as i32;
        if uri.eq_ignore_ascii_case(disk_uri) {
            lun = Some(options.lun);
        }
    }

    lun.ok_or_else(|| CloudError::LunNotFound(format!("disk {disk_uri} has no LUN")))
}

/// Serializes disk operations per node on top of a [`VmSet`].
pub struct DiskCoordinator {
    vm_set: Arc<dyn VmSet>,
    node_locks: LockMap,
    pending_attach: Queue<AttachOptions>,
    pending_detach: Queue<String>,
    in_flight: InFlightMap,
    rate_limiter: TokenBucket,
    initial_delay: Duration,
    lun_check: bool,
}

impl DiskCoordinator {
    pub fn new(vm_set: Arc<dyn VmSet>, config: &CloudConfig) -> Self {
        Self {
            vm_set,
            node_locks: LockMap::new(),
            pending_attach: Mutex::new(HashMap::new()),
            pending_detach: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            rate_limiter: TokenBucket::from_config(&config.attach_detach_rate_limit()),
            initial_delay: config.attach_detach_initial_delay(),
            lun_check: !config.disable_disk_lun_check,
        }
    }

    pub fn vm_set(&self) -> &Arc<dyn VmSet> {
        &self.vm_set
    }

    /// Attach a managed disk to a node and return its LUN.
    ///
    /// `disk` is the disk document when the caller has one; it drives the
    /// ownership check and the caching, encryption and write-accelerator
    /// options. With `allow_async`, the node lock is released before the VM
    /// update completes unless the rate limiter is exhausted. A caller whose
    /// disk was taken into such a batch waits for that batch and gets the LUN
    /// it assigned.
    pub async fn attach_disk(
        &self,
        disk_name: &str,
        disk_uri: &str,
        node_name: &str,
        caching: CachingMode,
        disk: Option<&Disk>,
        allow_async: bool,
    ) -> Result<i32> {
        let node = node_name.to_lowercase();
        let uri = disk_uri.to_lowercase();
        let mut options = AttachOptions {
            lun: -1,
            disk_name: disk_name.to_string(),
            caching,
            encryption_set_id: None,
            write_accelerator: false,
        };

        if let Some(disk) = disk {
            let shared = disk.max_shares.unwrap_or(1) > 1;
            if let Some(holder_id) = disk.managed_by.as_deref().filter(|id| !id.is_empty())
                && !shared
            {
                let holder = self.vm_set.get_node_name_by_provider_id(holder_id).await?;
                if holder.eq_ignore_ascii_case(&node) {
                    info!(
                        "azureDisk - disk({}) already attached to node({})",
                        disk_uri, node
                    );
                    self.vm_set.delete_cache_for_node(&node);
                    return self.get_disk_lun(disk_name, disk_uri, &node).await;
                }
                return Err(CloudError::Dangling {
                    disk: disk_uri.to_string(),
                    holder,
                });
            }
            if disk.state != DiskState::Unattached && !shared {
                return Err(CloudError::unexpected(format!(
                    "state of disk({disk_uri}) is {:?}, not in expected Unattached state",
                    disk.state
                )));
            }
            if disk.size_gb >= DISK_CACHING_LIMIT_GB && options.caching != CachingMode::None {
                info!(
                    "azureDisk - disk({}) is {} GiB, forcing caching mode None",
                    disk_uri, disk.size_gb
                );
                options.caching = CachingMode::None;
            }
            options.encryption_set_id = disk.encryption_set_id.clone();
            options.write_accelerator = disk.write_accelerator_enabled();
        }

        let queued = enqueue(&self.pending_attach, &node, &uri, options);
        let mut guard = Some(self.node_locks.lock(&node).await);
        if let Some(entry) = InFlight::find(&self.in_flight, &node, &uri) {
            withdraw(&self.pending_attach, &node, &uri);
            drop(guard);
            debug!(
                node = %node,
                lun = entry.lun,
                "azureDisk - disk({}) is being attached by a running batch",
                disk_uri
            );
            let lun = entry.lun;
            entry.wait().await?;
            return self.verify_attached(disk_name, disk_uri, &node, lun).await;
        }
        if queued == 1 && !self.initial_delay.is_zero() {
            debug!(node = %node, "waiting {:?} for more attach requests", self.initial_delay);
            tokio::time::sleep(self.initial_delay).await;
        }

        let mut batch = take(&self.pending_attach, &node);
        let reserved = InFlight::luns(&self.in_flight, &node);
        let (existing, _) = self.vm_set.get_data_disks(&node, ReadMode::Default).await?;
        let lun = match allocate_luns(&existing, &reserved, &mut batch, &uri) {
            Ok(lun) => lun,
            // Attached by another caller's batch while this one waited.
            Err(CloudError::LunNotFound(_)) if batch.is_empty() => {
                let (existing, _) = self.vm_set.get_data_disks(&node, ReadMode::ForceRefresh).await?;
                allocate_luns(&existing, &reserved, &mut batch, &uri)?
            }
            Err(e) => return Err(e),
        };
        if batch.is_empty() {
            debug!(node = %node, "azureDisk - disk({}) already attached on LUN {}", disk_uri, lun);
            return Ok(lun);
        }

        info!(
            node = %node,
            lun,
            "azureDisk - attaching {} disk(s): {:?}",
            batch.len(),
            batch.iter().map(|(uri, o)| (uri.as_str(), o.lun)).collect::<Vec<_>>()
        );
        let in_flight = InFlightBatch::publish(&self.in_flight, &node, &batch);
        let pending = match self.vm_set.attach_disk(&node, &batch).await {
            Ok(pending) => pending,
            Err(e) => {
                self.vm_set.delete_cache_for_node(&node);
                in_flight.finish(&Err(e.clone()));
                return Err(e);
            }
        };

        if allow_async {
            if self.rate_limiter.try_accept() {
                guard = None;
            } else {
                warn!(
                    node = %node,
                    "azureDisk - switch to batch operation due to rate limit, QPS: {}",
                    self.rate_limiter.qps()
                );
            }
        }
        let outcome = pending.wait("attach_disk").await;
        in_flight.finish(&outcome);
        outcome?;

        let lun = self.verify_attached(disk_name, disk_uri, &node, lun).await?;
        drop(guard);
        Ok(lun)
    }

    /// Re-read the node's data disks after an attach and return the LUN the
    /// disk ended up on. Skipped when the LUN check is disabled.
    async fn verify_attached(&self, disk_name: &str, disk_uri: &str, node: &str, lun: i32) -> Result<i32> {
        if !self.lun_check {
            return Ok(lun);
        }
        match self.get_disk_lun(disk_name, disk_uri, node).await {
            Ok(lun) => Ok(lun),
            Err(e @ CloudError::LunNotFound(_)) => {
                self.vm_set.delete_cache_for_node(node);
                Err(CloudError::PostCondition(format!(
                    "disk({disk_uri}) could not be found on node({node}) after attach: {e}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Detach a disk from a node. A node that no longer exists counts as
    /// detached.
    pub async fn detach_disk(&self, disk_name: &str, disk_uri: &str, node_name: &str) -> Result<()> {
        let node = node_name.to_lowercase();
        match self.vm_set.get_instance_id_by_node_name(&node).await {
            Ok(_) => {}
            Err(e) if e.is_instance_not_found() || e.is_not_found() => {
                info!(node = %node, "azureDisk - node not found, disk({}) is detached", disk_uri);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let queued = enqueue(&self.pending_detach, &node, &disk_uri.to_lowercase(), disk_name.to_string());
        let _guard = self.node_locks.lock(&node).await;
        if queued == 1 && !self.initial_delay.is_zero() {
            debug!(node = %node, "waiting {:?} for more detach requests", self.initial_delay);
            tokio::time::sleep(self.initial_delay).await;
        }

        let batch = take(&self.pending_detach, &node);
        if !batch.is_empty() {
            info!(node = %node, "azureDisk - detaching disks {:?}", batch);
            let result = match self.vm_set.detach_disk(&node, &batch).await {
                Ok(pending) => pending.wait("detach_disk").await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_instance_not_found() => {
                    warn!(node = %node, "azureDisk - instance disappeared during detach: {}", e);
                    return Ok(());
                }
                Err(e) => {
                    self.vm_set.delete_cache_for_node(&node);
                    return Err(e);
                }
            }
        }

        if self.lun_check {
            match self.get_disk_lun(disk_name, disk_uri, &node).await {
                Ok(lun) => {
                    self.vm_set.delete_cache_for_node(&node);
                    return Err(CloudError::PostCondition(format!(
                        "disk({disk_uri}) is still attached to node({node}) on LUN {lun}"
                    )));
                }
                Err(e) if e.is_instance_not_found() || matches!(e, CloudError::LunNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(node = %node, "azureDisk - detach disk({}) succeeded", disk_uri);
        Ok(())
    }

    /// Commit pending deferred detaches on a node.
    pub async fn update_vm(&self, node_name: &str) -> Result<()> {
        let node = node_name.to_lowercase();
        let _guard = self.node_locks.lock(&node).await;
        let result = match self.vm_set.update_vm(&node).await {
            Ok(pending) => pending.wait("update_vm").await,
            Err(e) => Err(e),
        };
        self.vm_set.delete_cache_for_node(&node);
        result
    }

    /// LUN of a disk on a node, matched by name, VHD URI or managed-disk id.
    pub async fn get_disk_lun(&self, disk_name: &str, disk_uri: &str, node_name: &str) -> Result<i32> {
        let (disks, provisioning_state) = self
            .vm_set
            .get_data_disks(node_name, ReadMode::Default)
            .await?;
        for disk in disks.iter().filter(|d| !d.to_be_detached) {
            if disk.matches(disk_name, disk_uri) {
                debug!(
                    "azureDisk - find disk: lun {} name {:?} uri {}",
                    disk.lun, disk.name, disk_uri
                );
                return Ok(disk.lun);
            }
        }
        Err(CloudError::LunNotFound(format!(
            "cannot find LUN for disk {disk_name} on node {node_name} (provisioning state {})",
            provisioning_state.as_deref().unwrap_or("unknown")
        )))
    }

    /// Whether each named disk is attached to the node. An unknown node
    /// reports every disk as detached.
    pub async fn disks_are_attached(
        &self,
        disk_names: &[String],
        node_name: &str,
    ) -> Result<HashMap<String, bool>> {
        let mut attached: HashMap<String, bool> =
            disk_names.iter().map(|name| (name.clone(), false)).collect();

        let disks = match self.vm_set.get_data_disks(node_name, ReadMode::Unsafe).await {
            Ok((disks, _)) => disks,
            Err(e) if e.is_instance_not_found() => {
                warn!(node = %node_name, "azureDisk - node not found, assuming disks {:?} are detached", disk_names);
                return Ok(attached);
            }
            Err(e) => return Err(e),
        };

        for disk in disks.iter().filter(|d| !d.to_be_detached) {
            for name in disk_names {
                if disk.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)) {
                    attached.insert(name.clone(), true);
                }
            }
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CreateOption;

    fn make_disk(lun: i32, name: &str) -> DataDisk {
        DataDisk {
            lun,
            name: Some(name.to_string()),
            managed_disk_id: Some(make_uri(name)),
            create_option: CreateOption::Attach,
            ..Default::default()
        }
    }

    fn make_uri(name: &str) -> String {
        format!("/subscriptions/sub/resourcegroups/rg/providers/microsoft.compute/disks/{name}")
    }

    fn make_batch(names: &[&str]) -> BTreeMap<String, AttachOptions> {
        names
            .iter()
            .map(|name| {
                (
                    make_uri(name),
                    AttachOptions {
                        lun: -1,
                        disk_name: name.to_string(),
                        caching: CachingMode::ReadOnly,
                        encryption_set_id: None,
                        write_accelerator: false,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_allocate_luns_fills_gaps() {
        let existing = vec![make_disk(0, "a"), make_disk(2, "b"), make_disk(5, "c")];
        let mut batch = make_batch(&["d1", "d2", "d3", "d4"]);

        let lun = allocate_luns(&existing, &[], &mut batch, &make_uri("d3")).unwrap();
        let luns: Vec<i32> = batch.values().map(|o| o.lun).collect();
        assert_eq!(luns, vec![1, 3, 4, 6]);
        assert_eq!(lun, 4);
    }

    #[test]
    fn test_allocate_luns_existing_disk_keeps_lun() {
        let existing = vec![make_disk(3, "a")];
        let mut batch = make_batch(&["a"]);

        let lun = allocate_luns(&existing, &[], &mut batch, &make_uri("A")).unwrap();
        assert_eq!(lun, 3);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_allocate_luns_exhausted() {
        let existing: Vec<DataDisk> = (0..MAX_LUN).map(|lun| make_disk(lun, &format!("d{lun}"))).collect();
        let mut batch = make_batch(&["new"]);
        assert!(allocate_luns(&existing, &[], &mut batch, &make_uri("new")).is_err());
    }

    #[test]
    fn test_allocate_luns_unknown_disk() {
        let mut batch = BTreeMap::new();
        let err = allocate_luns(&[make_disk(0, "a")], &[], &mut batch, &make_uri("b")).unwrap_err();
        assert!(matches!(err, CloudError::LunNotFound(_)));
    }

    #[test]
    fn test_allocate_luns_skips_reserved() {
        let existing = vec![make_disk(0, "a")];
        let mut batch = make_batch(&["d1", "d2"]);

        let lun = allocate_luns(&existing, &[1, 2], &mut batch, &make_uri("d2")).unwrap();
        let luns: Vec<i32> = batch.values().map(|o| o.lun).collect();
        assert_eq!(luns, vec![3, 4]);
        assert_eq!(lun, 4);
    }

    #[tokio::test]
    async fn test_in_flight_batch_shares_outcome() {
        let in_flight: InFlightMap = Mutex::new(HashMap::new());
        let mut batch = make_batch(&["a", "b"]);
        allocate_luns(&[], &[], &mut batch, &make_uri("a")).unwrap();
        let running = InFlightBatch::publish(&in_flight, "node-0", &batch);

        let entry = InFlight::find(&in_flight, "node-0", &make_uri("b")).unwrap();
        assert_eq!(entry.lun, 1);
        assert!(InFlight::find(&in_flight, "node-1", &make_uri("b")).is_none());
        let mut luns = InFlight::luns(&in_flight, "node-0");
        luns.sort_unstable();
        assert_eq!(luns, vec![0, 1]);

        let waiter = tokio::spawn(entry.wait());
        running.finish(&Ok(()));
        assert!(waiter.await.unwrap().is_ok());

        drop(running);
        assert!(InFlight::find(&in_flight, "node-0", &make_uri("a")).is_none());
        assert!(lock(&in_flight).is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_failure_reaches_waiters() {
        let in_flight: InFlightMap = Mutex::new(HashMap::new());
        let batch = make_batch(&["a"]);
        let running = InFlightBatch::publish(&in_flight, "node-0", &batch);
        let entry = InFlight::find(&in_flight, "node-0", &make_uri("a")).unwrap();

        running.finish(&Err(CloudError::from_response(409, "Conflict")));
        let err = entry.clone().wait().await.unwrap_err();
        assert!(err.to_string().contains("Conflict"));

        // A batch dropped without an outcome fails its waiters too.
        let abandoned = InFlightBatch::publish(&in_flight, "node-1", &batch);
        let entry = InFlight::find(&in_flight, "node-1", &make_uri("a")).unwrap();
        drop(abandoned);
        assert!(entry.wait().await.is_err());
    }

    #[test]
    fn test_queue_counts_per_node() {
        let queue: Queue<String> = Mutex::new(HashMap::new());
        assert_eq!(enqueue(&queue, "node-0", "a", "a".into()), 1);
        assert_eq!(enqueue(&queue, "node-0", "b", "b".into()), 2);
        assert_eq!(enqueue(&queue, "node-1", "a", "a".into()), 1);

        let batch = take(&queue, "node-0");
        assert_eq!(batch.len(), 2);
        assert!(take(&queue, "node-0").is_empty());
        assert_eq!(enqueue(&queue, "node-0", "c", "c".into()), 1);

        withdraw(&queue, "node-0", "c");
        withdraw(&queue, "node-2", "c");
        assert!(take(&queue, "node-0").is_empty());
        assert_eq!(take(&queue, "node-1").len(), 1);
    }
}
