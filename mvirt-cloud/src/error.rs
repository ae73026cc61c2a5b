//! Error types for the reconciliation core.

use std::time::Duration;

use thiserror::Error;

/// Message returned by the control plane when a scale-set instance is being deleted.
const VMSS_VM_NOT_ACTIVE: &str = "not an active virtual machine scale set vm instanceid";

/// Errors that can occur while talking to or reasoning about the cloud control plane.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// A remote object does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The VM behind a node, provider id or instance id is unknown or being deleted.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The control plane throttled the request.
    #[error("throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The concurrency token of a VM update was invalidated by a newer request.
    #[error("operation preempted: {0}")]
    OperationPreempted(String),

    /// The storage profile was accepted but the operation failed afterwards.
    /// Remote state is ambiguous and must be re-read.
    #[error("partial update: {0}")]
    PartialUpdate(String),

    /// The disk is attached to another node.
    #[error("disk {disk} is already attached to node {holder}")]
    Dangling { disk: String, holder: String },

    /// Caller supplied configuration violates a documented rule.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The disk is not present in the VM's data-disk list.
    #[error("cannot find Lun for disk {0}")]
    LunNotFound(String),

    /// A successful update did not produce the expected data-disk layout.
    #[error("post-condition failed: {0}")]
    PostCondition(String),

    /// Anything else reported by the control plane.
    #[error("unexpected error (status {status:?}): {message}")]
    Unexpected {
        status: Option<u16>,
        message: String,
    },

    /// Several independent operations failed.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<CloudError>),
}

fn join_errors(errors: &[CloudError]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", messages.join(", "))
}

impl CloudError {
    /// Classify a raw control-plane response.
    pub fn from_response(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if status == 404 {
            return CloudError::NotFound(message);
        }
        if status == 429 {
            return CloudError::Throttled {
                message,
                retry_after: None,
            };
        }
        if lower.contains("operationpreempted") {
            return CloudError::OperationPreempted(message);
        }
        if lower.contains(VMSS_VM_NOT_ACTIVE)
            || (status == 400
                && lower.contains("invalidparameter")
                && lower.contains("target=\"instanceids\""))
        {
            return CloudError::InstanceNotFound(message);
        }
        CloudError::Unexpected {
            status: Some(status),
            message,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        CloudError::Unexpected {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_instance_not_found(&self) -> bool {
        match self {
            CloudError::InstanceNotFound(_) => true,
            CloudError::Unexpected { message, .. } => {
                message.to_lowercase().contains(VMSS_VM_NOT_ACTIVE)
            }
            _ => false,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, CloudError::Throttled { .. })
    }

    pub fn is_preempted(&self) -> bool {
        matches!(self, CloudError::OperationPreempted(_))
    }

    /// True when the control plane answered 2xx but still reported an error.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            CloudError::Unexpected { status: Some(s), .. } if (200..300).contains(s)
        )
    }
}

/// Collapse a list of errors into a single result, flattening nested aggregates.
pub fn aggregate(errors: Vec<CloudError>) -> Result<()> {
    let mut flat = Vec::with_capacity(errors.len());
    for err in errors {
        match err {
            CloudError::Aggregate(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }

    match flat.len() {
        0 => Ok(()),
        1 => Err(flat.remove(0)),
        _ => Err(CloudError::Aggregate(flat)),
    }
}

/// Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = CloudError::from_response(404, "ResourceNotFound");
        assert!(err.is_not_found());
        assert!(!err.is_instance_not_found());
    }

    #[test]
    fn test_classify_throttled() {
        assert!(CloudError::from_response(429, "too many requests").is_throttled());
    }

    #[test]
    fn test_classify_preempted() {
        let err = CloudError::from_response(
            409,
            "Code=\"OperationPreempted\" Message=\"Operation execution has been preempted by a more recent operation.\"",
        );
        assert!(err.is_preempted());
    }

    #[test]
    fn test_classify_instance_not_found() {
        let inactive = CloudError::from_response(
            409,
            "The provided instanceId 3 is not an active Virtual Machine Scale Set VM instanceId.",
        );
        assert!(inactive.is_instance_not_found());

        let bad_target = CloudError::from_response(
            400,
            "Code=\"InvalidParameter\" Message=\"bad\" Target=\"instanceIds\"",
        );
        assert!(bad_target.is_instance_not_found());

        let other_400 = CloudError::from_response(400, "Code=\"InvalidParameter\" Target=\"lun\"");
        assert!(!other_400.is_instance_not_found());
    }

    #[test]
    fn test_accepted_status() {
        let err = CloudError::from_response(200, "disk attach failed after commit");
        assert!(err.is_accepted());
        assert!(!CloudError::from_response(500, "boom").is_accepted());
    }

    #[test]
    fn test_aggregate_flattens() {
        assert!(aggregate(vec![]).is_ok());

        let single = aggregate(vec![CloudError::NotFound("a".into())]).unwrap_err();
        assert!(single.is_not_found());

        let nested = aggregate(vec![
            CloudError::Aggregate(vec![
                CloudError::NotFound("a".into()),
                CloudError::unexpected("b"),
            ]),
            CloudError::unexpected("c"),
        ])
        .unwrap_err();
        match nested {
            CloudError::Aggregate(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}
