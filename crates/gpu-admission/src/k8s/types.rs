use core::error::Error;

/// Errors raised by the cluster facade.
#[derive(Debug, derive_more::Display)]
pub enum ClusterError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Cluster cache is not ready: {message}")]
    CacheNotReady { message: String },
    #[display("Failed to get configmap {namespace}/{name}")]
    ConfigMapGetFailed { namespace: String, name: String },
    #[display("Pod patch rejected, retry possible: {message}")]
    PatchRetryable { message: String },
    #[display("Pod patch failed: {message}")]
    PatchFailed { message: String },
}

impl Error for ClusterError {}

impl ClusterError {
    /// Conflict and server-timeout rejections may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PatchRetryable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_class_errors_are_retryable() {
        let retryable = ClusterError::PatchRetryable {
            message: "conflict".to_string(),
        };
        let terminal = ClusterError::PatchFailed {
            message: "forbidden".to_string(),
        };
        assert!(retryable.is_retryable());
        assert!(!terminal.is_retryable());
    }
}
