//! Cloud configuration.
//!
//! The configuration is read from a JSON cloud-config file. Only the options that
//! affect node and disk reconciliation are modelled here. [`CloudConfig::validate`]
//! fills in defaults and rejects combinations that the control plane cannot honour.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backoff::{self, BoundedBackoff};
use crate::error::{CloudError, Result};

pub const SCALE_SET_CACHE_TTL_DEFAULT_SECS: u64 = 600;
pub const INSTANCE_CACHE_TTL_DEFAULT_SECS: u64 = 600;
pub const AVAILABILITY_SET_NODES_CACHE_TTL_DEFAULT_SECS: u64 = 900;
pub const NON_UNIFORM_NODES_CACHE_TTL_DEFAULT_SECS: u64 = 900;

pub const BACKOFF_RETRIES_DEFAULT: u32 = 6;
pub const BACKOFF_EXPONENT_DEFAULT: f64 = 1.5;
pub const BACKOFF_DURATION_DEFAULT_SECS: u64 = 5;
pub const BACKOFF_JITTER_DEFAULT: f64 = 1.0;

pub const ATTACH_DETACH_QPS_DEFAULT: f32 = 6.0;
pub const ATTACH_DETACH_BUCKET_DEFAULT: u32 = 10;

const STACK_CLOUD_NAME: &str = "AZURESTACKCLOUD";

/// How VMs are managed in this cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Availability sets (standalone VMs).
    #[default]
    Standard,
    /// Uniform scale sets, optionally mixed with availability sets and flex sets.
    Vmss,
    /// Flexible scale sets only.
    #[serde(rename = "vmssflex")]
    VmssFlex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerSku {
    #[default]
    Basic,
    Standard,
}

/// How VMs join load-balancer backend pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendPoolType {
    /// The primary IP configuration of the primary NIC references the pool.
    #[default]
    #[serde(rename = "nodeIPConfiguration")]
    NodeIpConfiguration,
    /// The node's private IP is a pool address.
    #[serde(rename = "nodeIP")]
    NodeIp,
    /// Reserved; rewritten to `nodeIPConfiguration` during validation.
    #[serde(rename = "podIP")]
    PodIp,
}

/// Token bucket parameters for attach/detach operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(rename = "cloudProviderRateLimitQPSWrite")]
    pub qps: f32,
    #[serde(rename = "cloudProviderRateLimitBucketWrite")]
    pub bucket: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: ATTACH_DETACH_QPS_DEFAULT,
            bucket: ATTACH_DETACH_BUCKET_DEFAULT,
        }
    }
}

/// Configuration of the reconciliation core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    /// Cloud environment name, e.g. `AzurePublicCloud`.
    pub cloud: String,
    pub location: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub vm_type: VmType,

    /// Cluster name; also the name of the primary load balancer.
    pub cluster_name: String,
    pub primary_scale_set_name: String,
    pub primary_availability_set_name: String,

    /// Treat every node as a uniform scale-set instance.
    pub disable_availability_set_nodes: bool,
    pub enable_vmss_flex_nodes: bool,

    pub load_balancer_sku: LoadBalancerSku,
    pub load_balancer_resource_group: String,
    pub enable_multiple_standard_load_balancers: bool,
    /// Comma separated VM sets that share the primary standard load balancer.
    #[serde(rename = "nodePoolsWithoutDedicatedSLB")]
    pub node_pools_without_dedicated_slb: String,
    #[serde(rename = "excludeMasterFromStandardLB")]
    pub exclude_master_from_standard_lb: Option<bool>,
    #[serde(rename = "disableOutboundSNAT")]
    pub disable_outbound_snat: Option<bool>,
    pub load_balancer_backend_pool_configuration_type: BackendPoolType,
    /// `internal`, `external`, `all` or empty.
    pub pre_configured_backend_pool_load_balancer_types: String,
    pub vnet_name: String,
    pub vnet_resource_group: String,
    #[serde(rename = "ipv6DualStackEnabled")]
    pub ipv6_dual_stack_enabled: bool,

    #[serde(rename = "vmssCacheTTLInSeconds")]
    pub vmss_cache_ttl_secs: u64,
    #[serde(rename = "vmssVirtualMachinesCacheTTLInSeconds")]
    pub vmss_virtual_machines_cache_ttl_secs: u64,
    #[serde(rename = "availabilitySetNodesCacheTTLInSeconds")]
    pub availability_set_nodes_cache_ttl_secs: u64,
    #[serde(rename = "nonVmssUniformNodesCacheTTLInSeconds")]
    pub non_vmss_uniform_nodes_cache_ttl_secs: u64,

    pub cloud_provider_backoff: bool,
    pub cloud_provider_backoff_retries: u32,
    pub cloud_provider_backoff_exponent: f64,
    /// Seconds.
    pub cloud_provider_backoff_duration: u64,
    pub cloud_provider_backoff_jitter: f64,

    /// Concurrent instance updates per scale set; 0 means serial.
    #[serde(rename = "putVMSSVMBatchSize")]
    pub put_vmss_vm_batch_size: usize,
    /// 0 disables coalescing.
    pub attach_detach_initial_delay_in_ms: u64,
    pub attach_detach_disk_rate_limit: Option<RateLimitConfig>,
    /// Skip re-reading the data-disk list after attach/detach.
    pub disable_disk_lun_check: bool,
}

impl CloudConfig {
    /// Parse a JSON cloud-config document.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CloudError::ConfigurationInvalid(format!("failed to parse config: {e}")))
    }

    /// Read and parse a cloud-config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CloudError::ConfigurationInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Apply defaults and reject unsupported combinations.
    pub fn validate(mut self) -> Result<Self> {
        if self.disable_availability_set_nodes && self.vm_type != VmType::Vmss {
            return Err(CloudError::ConfigurationInvalid(
                "disableAvailabilitySetNodes is only supported when vmType is 'vmss'".into(),
            ));
        }
        if self.enable_vmss_flex_nodes && self.vm_type != VmType::Vmss {
            return Err(CloudError::ConfigurationInvalid(
                "enableVmssFlexNodes is only supported when vmType is 'vmss'".into(),
            ));
        }

        if self.load_balancer_backend_pool_configuration_type == BackendPoolType::PodIp {
            warn!("loadBalancerBackendPoolConfigurationType podIP is not supported, using nodeIPConfiguration");
            self.load_balancer_backend_pool_configuration_type = BackendPoolType::NodeIpConfiguration;
        }

        match self.load_balancer_sku {
            LoadBalancerSku::Standard => {
                self.exclude_master_from_standard_lb.get_or_insert(true);
                self.disable_outbound_snat.get_or_insert(false);
            }
            LoadBalancerSku::Basic => {
                if self.disable_outbound_snat == Some(true) {
                    return Err(CloudError::ConfigurationInvalid(
                        "disableOutboundSNAT should only set when loadBalancerSku is standard"
                            .into(),
                    ));
                }
            }
        }

        if self.vmss_cache_ttl_secs == 0 {
            self.vmss_cache_ttl_secs = SCALE_SET_CACHE_TTL_DEFAULT_SECS;
        }
        if self.vmss_virtual_machines_cache_ttl_secs == 0 {
            self.vmss_virtual_machines_cache_ttl_secs = INSTANCE_CACHE_TTL_DEFAULT_SECS;
        }
        if self.availability_set_nodes_cache_ttl_secs == 0 {
            self.availability_set_nodes_cache_ttl_secs =
                AVAILABILITY_SET_NODES_CACHE_TTL_DEFAULT_SECS;
        }
        if self.non_vmss_uniform_nodes_cache_ttl_secs == 0 {
            self.non_vmss_uniform_nodes_cache_ttl_secs = NON_UNIFORM_NODES_CACHE_TTL_DEFAULT_SECS;
        }

        if self.cloud_provider_backoff {
            if self.cloud_provider_backoff_retries == 0 {
                self.cloud_provider_backoff_retries = BACKOFF_RETRIES_DEFAULT;
            }
            if self.cloud_provider_backoff_exponent == 0.0 {
                self.cloud_provider_backoff_exponent = BACKOFF_EXPONENT_DEFAULT;
            }
            if self.cloud_provider_backoff_duration == 0 {
                self.cloud_provider_backoff_duration = BACKOFF_DURATION_DEFAULT_SECS;
            }
            if self.cloud_provider_backoff_jitter == 0.0 {
                self.cloud_provider_backoff_jitter = BACKOFF_JITTER_DEFAULT;
            }
        }

        if self.attach_detach_disk_rate_limit.is_none() {
            self.attach_detach_disk_rate_limit = Some(RateLimitConfig::default());
        }

        Ok(self)
    }

    // =========================================================================
    // Derived settings
    // =========================================================================

    pub fn use_standard_load_balancer(&self) -> bool {
        self.load_balancer_sku == LoadBalancerSku::Standard
    }

    pub fn exclude_master_nodes_from_standard_lb(&self) -> bool {
        self.exclude_master_from_standard_lb.unwrap_or(false)
    }

    /// Single standard load balancer shared by every VM set.
    pub fn use_single_standard_load_balancer(&self) -> bool {
        self.use_standard_load_balancer() && !self.enable_multiple_standard_load_balancers
    }

    /// Deferred detach is not available on stack clouds.
    pub fn is_stack_cloud(&self) -> bool {
        self.cloud.eq_ignore_ascii_case(STACK_CLOUD_NAME)
    }

    /// Lowercased VM sets that share the primary standard load balancer.
    pub fn vm_sets_sharing_primary_slb(&self) -> HashSet<String> {
        self.node_pools_without_dedicated_slb
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn load_balancer_resource_group(&self) -> &str {
        if self.load_balancer_resource_group.is_empty() {
            &self.resource_group
        } else {
            &self.load_balancer_resource_group
        }
    }

    pub fn vnet_resource_group(&self) -> &str {
        if self.vnet_resource_group.is_empty() {
            &self.resource_group
        } else {
            &self.vnet_resource_group
        }
    }

    /// Name of the VM set fronted by the cluster's primary load balancer.
    pub fn primary_vm_set_name(&self) -> &str {
        match self.vm_type {
            VmType::Vmss | VmType::VmssFlex => &self.primary_scale_set_name,
            VmType::Standard => &self.primary_availability_set_name,
        }
    }

    pub fn scale_set_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.vmss_cache_ttl_secs)
    }

    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.vmss_virtual_machines_cache_ttl_secs)
    }

    pub fn availability_set_nodes_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_set_nodes_cache_ttl_secs)
    }

    pub fn non_uniform_nodes_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.non_vmss_uniform_nodes_cache_ttl_secs)
    }

    pub fn attach_detach_initial_delay(&self) -> Duration {
        Duration::from_millis(self.attach_detach_initial_delay_in_ms)
    }

    pub fn attach_detach_rate_limit(&self) -> RateLimitConfig {
        self.attach_detach_disk_rate_limit.unwrap_or_default()
    }

    /// Retry policy for plain resource reads. `cloudProviderBackoffRetries`
    /// counts attempts, so the policy retries one time fewer. Without
    /// `cloudProviderBackoff` a read is attempted once.
    pub fn request_backoff(&self) -> BoundedBackoff {
        if !self.cloud_provider_backoff {
            return BoundedBackoff::none();
        }
        BoundedBackoff::new(
            backoff::exponential(
                Duration::from_secs(self.cloud_provider_backoff_duration),
                self.cloud_provider_backoff_exponent,
                self.cloud_provider_backoff_jitter,
            ),
            self.cloud_provider_backoff_retries.saturating_sub(1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(raw: &str) -> CloudConfig {
        CloudConfig::from_json(raw).unwrap()
    }

    #[test]
    fn test_parse_camel_case_keys() {
        let config = make_config(
            r#"{
                "cloud": "AzurePublicCloud",
                "location": "westeurope",
                "resourceGroup": "rg",
                "vmType": "vmss",
                "loadBalancerSku": "standard",
                "putVMSSVMBatchSize": 4,
                "attachDetachInitialDelayInMs": 1000,
                "nodePoolsWithoutDedicatedSLB": "Pool1, pool2",
                "loadBalancerBackendPoolConfigurationType": "nodeIP"
            }"#,
        );
        assert_eq!(config.vm_type, VmType::Vmss);
        assert_eq!(config.load_balancer_sku, LoadBalancerSku::Standard);
        assert_eq!(config.put_vmss_vm_batch_size, 4);
        assert_eq!(config.attach_detach_initial_delay(), Duration::from_millis(1000));
        assert_eq!(
            config.load_balancer_backend_pool_configuration_type,
            BackendPoolType::NodeIp
        );
        let shared = config.vm_sets_sharing_primary_slb();
        assert!(shared.contains("pool1"));
        assert!(shared.contains("pool2"));
    }

    #[test]
    fn test_validate_defaults() {
        let config = make_config(r#"{"loadBalancerSku": "standard"}"#)
            .validate()
            .unwrap();
        assert_eq!(config.vm_type, VmType::Standard);
        assert_eq!(config.exclude_master_from_standard_lb, Some(true));
        assert_eq!(config.disable_outbound_snat, Some(false));
        assert_eq!(config.scale_set_cache_ttl(), Duration::from_secs(600));
        assert_eq!(config.availability_set_nodes_cache_ttl(), Duration::from_secs(900));
        assert_eq!(config.attach_detach_rate_limit(), RateLimitConfig::default());
    }

    #[test]
    fn test_validate_rejects_flags_outside_vmss() {
        let err = make_config(r#"{"vmType": "standard", "disableAvailabilitySetNodes": true}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CloudError::ConfigurationInvalid(_)));

        let err = make_config(r#"{"vmType": "vmssflex", "enableVmssFlexNodes": true}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CloudError::ConfigurationInvalid(_)));

        assert!(
            make_config(r#"{"vmType": "vmss", "disableAvailabilitySetNodes": true}"#)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_validate_rejects_snat_on_basic() {
        let err = make_config(r#"{"loadBalancerSku": "basic", "disableOutboundSNAT": true}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CloudError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_pod_ip_is_rewritten() {
        let config = make_config(r#"{"loadBalancerBackendPoolConfigurationType": "podIP"}"#)
            .validate()
            .unwrap();
        assert_eq!(
            config.load_balancer_backend_pool_configuration_type,
            BackendPoolType::NodeIpConfiguration
        );
    }

    #[test]
    fn test_backoff_defaults_only_when_enabled() {
        let disabled = make_config("{}").validate().unwrap();
        assert_eq!(disabled.cloud_provider_backoff_retries, 0);
        assert_eq!(disabled.request_backoff().remaining(), 0);

        let enabled = make_config(r#"{"cloudProviderBackoff": true}"#)
            .validate()
            .unwrap();
        assert_eq!(enabled.cloud_provider_backoff_retries, BACKOFF_RETRIES_DEFAULT);
        assert_eq!(enabled.cloud_provider_backoff_duration, BACKOFF_DURATION_DEFAULT_SECS);
        assert_eq!(enabled.request_backoff().remaining(), BACKOFF_RETRIES_DEFAULT - 1);
    }

    #[test]
    fn test_stack_cloud() {
        assert!(make_config(r#"{"cloud": "AzureStackCloud"}"#).is_stack_cloud());
        assert!(!make_config(r#"{"cloud": "AzurePublicCloud"}"#).is_stack_cloud());
    }
}
