//! Error types for the Surge operator

use thiserror::Error;

/// Main error type for Surge operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CGU specs (invalid cluster, unknown canary, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// A managed policy's nested payload is missing a required level
    #[error("policy format error: {0}")]
    PolicyFormat(String),

    /// A child resource the status says exists could not be used
    #[error("child resource error: {0}")]
    ChildResource(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a policy format error with the given message
    pub fn policy_format(msg: impl Into<String>) -> Self {
        Self::PolicyFormat(msg.into())
    }

    /// Create a child resource error with the given message
    pub fn child_resource(msg: impl Into<String>) -> Self {
        Self::ChildResource(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if this wraps a Kubernetes API conflict (stale resource version)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True if this wraps a Kubernetes API not-found response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn validation_errors_carry_their_message() {
        let err = Error::validation("canary cluster spoke9 is not in the resolved cluster set");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("spoke9"));
    }

    #[test]
    fn policy_format_errors_name_the_missing_level() {
        let err = Error::policy_format("policy p1 is missing spec.policy-templates");
        assert!(err.to_string().contains("policy-templates"));
    }

    #[test]
    fn conflict_detection_matches_409_only() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::validation("nope").is_conflict());
    }

    #[test]
    fn not_found_detection_matches_404_only() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
    }

    /// Different error categories require different handling in the
    /// reconciliation loop (retry, surface on condition, fail out).
    #[test]
    fn error_categorization_for_controller_handling() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Validation(_) => "cannot_start",
                Error::PolicyFormat(_) => "cannot_start",
                Error::Kube(_) => "retry",
                Error::ChildResource(_) => "retry",
                Error::Serialization(_) => "fail",
            }
        }

        assert_eq!(categorize(&Error::validation("bad spec")), "cannot_start");
        assert_eq!(categorize(&api_error(500)), "retry");
        assert_eq!(categorize(&Error::serialization("bug")), "fail");
    }
}
