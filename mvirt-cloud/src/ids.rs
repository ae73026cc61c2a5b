//! Resource identifier grammar.
//!
//! Uniform scale-set instance ids look like
//! `/subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Compute/virtualMachineScaleSets/<vmss>/virtualMachines/<n>`.
//! Provider ids are the same ids with an `azure://` prefix. Availability-set and
//! flex VMs are plain `.../virtualMachines/<name>` ids.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{CloudError, Result};

pub const PROVIDER_ID_PREFIX: &str = "azure://";
pub const INTERNAL_LB_SUFFIX: &str = "-internal";
pub const IPV6_POOL_SUFFIX: &str = "-IPv6";

static SCALE_SET_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*/subscriptions/(?:.*)/Microsoft.Compute/virtualMachineScaleSets/(.+)/virtualMachines(?:.*)")
        .expect("valid regex")
});

static SCALE_SET_RESOURCE_GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r".*/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft.Compute/virtualMachineScaleSets/(?:.*)/virtualMachines(?:.*)",
    )
    .expect("valid regex")
});

static SCALE_SET_IP_CONFIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r".*/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft.Compute/virtualMachineScaleSets/(.+)/virtualMachines/(.+)/networkInterfaces(?:.*)",
    )
    .expect("valid regex")
});

static SCALE_SET_VM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft.Compute/virtualMachineScaleSets/(.+)/virtualMachines/(?:\d+)$",
    )
    .expect("valid regex")
});

static NIC_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft.Network/networkInterfaces/(.+)/ipConfigurations/(?:.*)",
    )
    .expect("valid regex")
});

static BACKEND_POOL_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft.Network/loadBalancers/(.+)/backendAddressPools/(?:.*)",
    )
    .expect("valid regex")
});

static NODE_PROVIDER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^azure:///subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft.Compute/(?:.*)")
        .expect("valid regex")
});

static RESOURCE_GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*/subscriptions/(?:.*)/resourceGroups/(.+)/providers/(?:.*)").expect("valid regex")
});

fn not_scale_set_instance(id: &str) -> CloudError {
    CloudError::InstanceNotFound(format!("{id} is not a scale set instance"))
}

// =============================================================================
// Scale-set instances
// =============================================================================

/// Instance id encoded base-36 in the last six characters of a computer name.
pub fn instance_id_from_computer_name(name: &str) -> Option<u64> {
    if name.len() < 6 || !name.is_char_boundary(name.len() - 6) {
        return None;
    }
    let suffix = &name[name.len() - 6..];
    if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    u64::from_str_radix(suffix, 36).ok()
}

/// Computer name without its six-character instance suffix.
pub fn computer_name_stem(name: &str) -> Option<&str> {
    instance_id_from_computer_name(name)?;
    Some(&name[..name.len() - 6])
}

/// True for ids of uniform scale-set instances.
pub fn is_scale_set_instance_id(id: &str) -> bool {
    SCALE_SET_NAME_RE.is_match(id)
}

/// Scale-set name from a uniform instance or provider id.
pub fn scale_set_name_from_id(id: &str) -> Result<String> {
    SCALE_SET_NAME_RE
        .captures(id)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| not_scale_set_instance(id))
}

/// Resource group from a uniform instance or provider id.
pub fn scale_set_resource_group_from_id(id: &str) -> Result<String> {
    SCALE_SET_RESOURCE_GROUP_RE
        .captures(id)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| not_scale_set_instance(id))
}

/// `(scale set, resource group)` of a uniform instance id, with or without the provider prefix.
pub fn scale_set_and_resource_group_from_vm_id(id: &str) -> Result<(String, String)> {
    let id = id.strip_prefix(PROVIDER_ID_PREFIX).unwrap_or(id);
    SCALE_SET_VM_ID_RE
        .captures(id)
        .map(|caps| (caps[2].to_string(), caps[1].to_string()))
        .ok_or_else(|| not_scale_set_instance(id))
}

/// Parts of a uniform scale-set IP configuration id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleSetIpConfig {
    pub resource_group: String,
    pub scale_set: String,
    pub instance_id: String,
}

pub fn parse_scale_set_ip_config_id(id: &str) -> Option<ScaleSetIpConfig> {
    let caps = SCALE_SET_IP_CONFIG_RE.captures(id)?;
    Some(ScaleSetIpConfig {
        resource_group: caps[1].to_string(),
        scale_set: caps[2].to_string(),
        instance_id: caps[3].to_string(),
    })
}

/// Full id of a uniform scale-set instance, with the resource group lowercased.
pub fn scale_set_vm_id(subscription: &str, resource_group: &str, scale_set: &str, instance_id: &str) -> String {
    format!(
        "/subscriptions/{subscription}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{scale_set}/virtualMachines/{instance_id}",
        resource_group.to_lowercase()
    )
}

// =============================================================================
// NICs and provider ids
// =============================================================================

/// `(resource group, NIC name)` from a standalone NIC IP configuration id.
pub fn parse_nic_ip_config_id(id: &str) -> Option<(String, String)> {
    let caps = NIC_ID_RE.captures(id)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// True when the provider id is not in the compute grammar of this cloud.
pub fn is_unmanaged_provider_id(provider_id: &str) -> bool {
    !NODE_PROVIDER_ID_RE.is_match(provider_id)
}

/// Lowercase the resource-group segment of a resource id.
pub fn lowercase_resource_group(id: &str) -> Result<String> {
    let caps = RESOURCE_GROUP_RE
        .captures(id)
        .ok_or_else(|| CloudError::unexpected(format!("{id:?} is not a resource id")))?;
    let group = &caps[1];
    Ok(id.replacen(group, &group.to_lowercase(), 1))
}

/// Resource group of any resource id.
pub fn resource_group_from_id(id: &str) -> Option<String> {
    RESOURCE_GROUP_RE.captures(id).map(|caps| caps[1].to_string())
}

/// Last non-empty segment after `separator`.
pub fn last_segment(id: &str, separator: char) -> Result<&str> {
    match id.rsplit(separator).next() {
        Some(segment) if !segment.is_empty() => Ok(segment),
        _ => Err(CloudError::unexpected(format!(
            "resource name was missing from identifier {id:?}"
        ))),
    }
}

/// VM name from a standalone VM provider id, lowercased.
pub fn vm_name_from_provider_id(provider_id: &str) -> Result<String> {
    if is_unmanaged_provider_id(provider_id) && !provider_id.starts_with("/subscriptions/") {
        return Err(CloudError::unexpected(format!(
            "{provider_id:?} is not a valid provider id"
        )));
    }
    Ok(last_segment(provider_id, '/')?.to_lowercase())
}

// =============================================================================
// Disks
// =============================================================================

/// Parts of a managed-disk id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedDiskId {
    pub subscription: String,
    pub resource_group: String,
    pub name: String,
}

/// Parse `/subscriptions/<sub>/resourceGroups/<rg>/providers/<ns>/disks/<name>`.
///
/// The id must have exactly nine `/`-separated segments, the first one empty.
pub fn parse_managed_disk_id(id: &str) -> Result<ManagedDiskId> {
    let parts: Vec<&str> = id.split('/').collect();
    let valid = parts.len() == 9
        && parts[0].is_empty()
        && parts[1].eq_ignore_ascii_case("subscriptions")
        && parts[3].eq_ignore_ascii_case("resourceGroups")
        && parts[5].eq_ignore_ascii_case("providers")
        && parts[7].eq_ignore_ascii_case("disks")
        && !parts[8].is_empty();
    if !valid {
        return Err(CloudError::unexpected(format!(
            "invalid managed disk id {id:?}"
        )));
    }
    Ok(ManagedDiskId {
        subscription: parts[2].to_string(),
        resource_group: parts[4].to_string(),
        name: parts[8].to_string(),
    })
}

// =============================================================================
// Load balancers
// =============================================================================

pub fn backend_pool_id(subscription: &str, resource_group: &str, lb_name: &str, pool_name: &str) -> String {
    format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Network/loadBalancers/{lb_name}/backendAddressPools/{pool_name}"
    )
}

/// Load-balancer name of a backend pool id.
pub fn load_balancer_name_from_pool_id(pool_id: &str) -> Result<String> {
    BACKEND_POOL_ID_RE
        .captures(pool_id)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| CloudError::unexpected(format!("backend pool id {pool_id:?} is in wrong format")))
}

/// Check whether `new_pool` sits on the same load balancer as every pool in `existing`.
///
/// `<lb>` and `<lb>-internal` count as the same load balancer. On mismatch the
/// foreign load-balancer name is returned.
pub fn is_backend_pool_on_same_lb(new_pool: &str, existing: &[String]) -> Result<(bool, Option<String>)> {
    let new_lb = load_balancer_name_from_pool_id(new_pool)?;
    let new_lb = new_lb.strip_suffix(INTERNAL_LB_SUFFIX).unwrap_or(&new_lb);

    for pool in existing {
        let lb = load_balancer_name_from_pool_id(pool)?;
        let trimmed = lb.strip_suffix(INTERNAL_LB_SUFFIX).unwrap_or(&lb);
        if !trimmed.eq_ignore_ascii_case(new_lb) {
            return Ok((false, Some(lb)));
        }
    }
    Ok((true, None))
}

// =============================================================================
// Identifier inspection
// =============================================================================

/// What the identifier grammar recognises in an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedId {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<String>,
}

pub fn inspect(id: &str) -> ParsedId {
    if let Some(ip_config) = parse_scale_set_ip_config_id(id) {
        return ParsedId {
            kind: "scale-set-ip-configuration".into(),
            resource_group: Some(ip_config.resource_group),
            scale_set: Some(ip_config.scale_set),
            instance_id: Some(ip_config.instance_id),
            ..Default::default()
        };
    }
    if let Some((resource_group, nic)) = parse_nic_ip_config_id(id) {
        return ParsedId {
            kind: "nic-ip-configuration".into(),
            resource_group: Some(resource_group),
            nic: Some(nic),
            ..Default::default()
        };
    }
    if let Ok(disk) = parse_managed_disk_id(id) {
        return ParsedId {
            kind: "managed-disk".into(),
            resource_group: Some(disk.resource_group),
            disk: Some(disk.name),
            ..Default::default()
        };
    }
    if let Ok(lb) = load_balancer_name_from_pool_id(id) {
        return ParsedId {
            kind: "backend-pool".into(),
            resource_group: resource_group_from_id(id),
            load_balancer: Some(lb),
            ..Default::default()
        };
    }
    if is_scale_set_instance_id(id) {
        return ParsedId {
            kind: "scale-set-instance".into(),
            resource_group: scale_set_resource_group_from_id(id).ok(),
            scale_set: scale_set_name_from_id(id).ok(),
            instance_id: last_segment(id, '/').ok().map(str::to_string),
            ..Default::default()
        };
    }
    if let Some(resource_group) = resource_group_from_id(id) {
        return ParsedId {
            kind: "virtual-machine".into(),
            resource_group: Some(resource_group),
            ..Default::default()
        };
    }
    ParsedId {
        kind: "unknown".into(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VMSS_PROVIDER_ID: &str = "azure:///subscriptions/sub/resourceGroups/RG/providers/Microsoft.Compute/virtualMachineScaleSets/pool-vmss/virtualMachines/3";
    const AVSET_PROVIDER_ID: &str = "azure:///subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/Agent-0";

    #[test]
    fn test_instance_id_from_computer_name() {
        assert_eq!(instance_id_from_computer_name("aks-pool-vmss000003"), Some(3));
        assert_eq!(instance_id_from_computer_name("aks-pool-vmss00000z"), Some(35));
        assert_eq!(instance_id_from_computer_name("aks-pool-vmss000010"), Some(36));
        assert_eq!(instance_id_from_computer_name("short"), None);
        assert_eq!(instance_id_from_computer_name("agent-pool-0"), None);
        assert_eq!(computer_name_stem("aks-pool-vmss000003"), Some("aks-pool-vmss"));
    }

    #[test]
    fn test_scale_set_provider_id() {
        assert!(is_scale_set_instance_id(VMSS_PROVIDER_ID));
        assert!(!is_scale_set_instance_id(AVSET_PROVIDER_ID));
        assert_eq!(scale_set_name_from_id(VMSS_PROVIDER_ID).unwrap(), "pool-vmss");
        assert_eq!(scale_set_resource_group_from_id(VMSS_PROVIDER_ID).unwrap(), "RG");
        assert_eq!(
            scale_set_and_resource_group_from_vm_id(VMSS_PROVIDER_ID).unwrap(),
            ("pool-vmss".to_string(), "RG".to_string())
        );
        assert!(scale_set_name_from_id(AVSET_PROVIDER_ID).unwrap_err().is_instance_not_found());
    }

    #[test]
    fn test_ip_config_ids() {
        let vmss = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/pool-vmss/virtualMachines/7/networkInterfaces/nic/ipConfigurations/ipconfig1";
        assert_eq!(
            parse_scale_set_ip_config_id(vmss),
            Some(ScaleSetIpConfig {
                resource_group: "rg".into(),
                scale_set: "pool-vmss".into(),
                instance_id: "7".into(),
            })
        );

        let nic = "/subscriptions/sub/resourcegroups/rg/providers/Microsoft.Network/networkInterfaces/agent-0-nic/ipConfigurations/ipconfig1";
        assert!(parse_scale_set_ip_config_id(nic).is_none());
        assert_eq!(
            parse_nic_ip_config_id(nic),
            Some(("rg".to_string(), "agent-0-nic".to_string()))
        );
    }

    #[test]
    fn test_lowercase_resource_group() {
        assert_eq!(
            lowercase_resource_group("/subscriptions/sub/resourceGroups/MyRG/providers/Microsoft.Compute/virtualMachines/vm").unwrap(),
            "/subscriptions/sub/resourceGroups/myrg/providers/Microsoft.Compute/virtualMachines/vm"
        );
        assert!(lowercase_resource_group("vm-0").is_err());
    }

    #[test]
    fn test_vm_name_from_provider_id() {
        assert_eq!(vm_name_from_provider_id(AVSET_PROVIDER_ID).unwrap(), "agent-0");
        assert_eq!(
            vm_name_from_provider_id("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm-1").unwrap(),
            "vm-1"
        );
        assert!(vm_name_from_provider_id("kind://node-1").is_err());
        assert!(vm_name_from_provider_id("azure:///subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/").is_err());
    }

    #[test]
    fn test_parse_managed_disk_id() {
        let disk = parse_managed_disk_id("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/data-0").unwrap();
        assert_eq!(disk.subscription, "sub");
        assert_eq!(disk.resource_group, "rg");
        assert_eq!(disk.name, "data-0");

        assert!(parse_managed_disk_id("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks").is_err());
        assert!(parse_managed_disk_id("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/d/extra").is_err());
        assert!(parse_managed_disk_id("https://account.blob.core.windows.net/vhds/disk.vhd").is_err());
    }

    #[test]
    fn test_is_backend_pool_on_same_lb() {
        let pool = |lb: &str| backend_pool_id("sub", "rg", lb, "kubernetes");

        let (same, foreign) =
            is_backend_pool_on_same_lb(&pool("cluster"), &[pool("cluster-internal"), pool("Cluster")]).unwrap();
        assert!(same);
        assert!(foreign.is_none());

        let (same, foreign) = is_backend_pool_on_same_lb(&pool("cluster"), &[pool("other")]).unwrap();
        assert!(!same);
        assert_eq!(foreign.as_deref(), Some("other"));

        assert!(is_backend_pool_on_same_lb("bogus", &[]).is_err());
    }

    #[test]
    fn test_unmanaged_provider_id() {
        assert!(!is_unmanaged_provider_id(VMSS_PROVIDER_ID));
        assert!(is_unmanaged_provider_id("kind://docker/kind/kind-worker"));
    }

    #[test]
    fn test_inspect() {
        assert_eq!(inspect(VMSS_PROVIDER_ID).kind, "scale-set-instance");
        assert_eq!(inspect(VMSS_PROVIDER_ID).instance_id.as_deref(), Some("3"));
        assert_eq!(
            inspect("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/d").kind,
            "managed-disk"
        );
        assert_eq!(inspect("nonsense").kind, "unknown");
    }
}
