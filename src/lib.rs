//! Surge - Kubernetes operator for staged remediation of managed policies
//!
//! Surge drives a fleet of managed clusters toward compliance with a set of
//! inform-mode policies. A `ClusterGroupUpgrade` (CGU) declares the target
//! clusters, the ordered policies to enforce, and a remediation strategy
//! (canaries, batch concurrency, timeouts). The controller plans an ordered
//! batch roll-out, materializes enforcing policy copies scoped by placement
//! selection, and advances each cluster through the policy list until every
//! batch is compliant or a timeout fires.
//!
//! # Modules
//!
//! - [`crd`] - The ClusterGroupUpgrade custom resource definition
//! - [`controller`] - Reconciliation dispatch and controller runner
//! - [`stores`] - Trait-backed access to policies, placements, clusters and
//!   remote observation objects
//! - [`validate`] - Target cluster set resolution and spec validation
//! - [`resolve`] - Managed policy resolution and subscription content
//! - [`plan`] - Remediation plan construction
//! - [`materialize`] - Enforcing policy copies, placement rules and bindings
//! - [`batch`] - Per-batch cursor advancement and timeout accounting
//! - [`blocking`] - Prerequisite CGU checks
//! - [`status`] - Conflict-retried status persistence
//! - [`names`] - Bounded-length safe resource names
//! - [`object`] - Accessors over untyped policy payloads
//! - [`collaborators`] - Backup/precache delegation and action hooks
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff and conflict-retry helpers
//! - [`telemetry`] - Tracing subscriber setup
//! - [`clock`] - Injectable time source
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod batch;
pub mod blocking;
pub mod clock;
pub mod collaborators;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod materialize;
pub mod names;
pub mod object;
pub mod plan;
pub mod resolve;
pub mod retry;
pub mod status;
pub mod stores;
pub mod telemetry;
pub mod validate;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known labels, annotations and names
// =============================================================================

/// Label carried by every child resource the operator creates
pub const APP_LABEL_VALUE: &str = "cluster-group-upgrades";

/// Label selecting the child resources of one CGU (value = CGU name)
pub const OWNER_LABEL: &str = "surge.dev/clusterGroupUpgrade";

/// Label on enforcing policy copies naming the parent managed policy
pub const PARENT_POLICY_LABEL: &str = "surge.dev/parentPolicyName";

/// Label on placement rules naming the policy copy they scope
pub const FOR_POLICY_LABEL: &str = "surge.dev/forPolicy";

/// Annotation carrying the desired (pre-truncation) resource name
pub const DESIRED_NAME_ANNOTATION: &str = "surge.dev/desiredResourceName";

/// Finalizer driving cross-cluster observation cleanup on CGU deletion
pub const CLEANUP_FINALIZER: &str = "surge.dev/cleanup-finalizer";

/// Upper bound for Kubernetes object names minted by the operator
pub const MAX_OBJECT_NAME_LEN: usize = 253;

/// Upper bound for policy names; replicated policy names must also fit the
/// `<namespace>.<name>` child form on managed clusters
pub const MAX_POLICY_NAME_LEN: usize = 63;
