//! Kubernetes object name rules for request parameters.

use std::sync::LazyLock;

use regex::Regex;

use super::ApiError;

static POD_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

static NAMESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// DNS subdomain, at most 253 characters
pub fn is_valid_pod_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && POD_NAME_REGEX.is_match(name)
}

/// DNS label, at most 63 characters
pub fn is_valid_namespace(name: &str) -> bool {
    !name.is_empty() && name.len() <= 63 && NAMESPACE_REGEX.is_match(name)
}

/// Reject a namespace/pod pair that cannot name a real pod
pub fn validate_target(namespace: &str, pod: &str) -> Result<(), ApiError> {
    if !is_valid_pod_name(pod) {
        return Err(ApiError::bad_request(
            "Invalid pod name",
            "Pod name must match Kubernetes naming conventions (lowercase, numbers, dashes)",
        ));
    }
    if !is_valid_namespace(namespace) {
        return Err(ApiError::bad_request(
            "Invalid namespace",
            "Namespace must match Kubernetes naming conventions",
        ));
    }
    Ok(())
}
