//! Prerequisite CGU checks.
//!
//! A CGU may name other CGUs that must finish first. A missing blocking CGU
//! and an incomplete one are reported separately so the status message can
//! say which is which; either keeps this CGU in CannotStart.

use tracing::debug;

use crate::crd::{ClusterGroupUpgrade, UpgradePhase};
use crate::stores::CguStore;
use crate::Result;

/// Outcome of evaluating the blocking CGU references
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockingReport {
    /// Referenced CGUs that do not exist
    pub missing: Vec<String>,
    /// Referenced CGUs that exist but have not completed
    pub not_completed: Vec<String>,
}

impl BlockingReport {
    /// True when nothing blocks the upgrade from starting
    pub fn is_clear(&self) -> bool {
        self.missing.is_empty() && self.not_completed.is_empty()
    }
}

/// Evaluate every blocking CGU reference on the spec.
///
/// A blocking CGU with no status conditions at all counts as not completed:
/// something went wrong processing it and its outcome cannot be trusted.
pub async fn blocking_crs_not_completed(
    cgus: &dyn CguStore,
    cgu: &ClusterGroupUpgrade,
) -> Result<BlockingReport> {
    let mut report = BlockingReport::default();

    for blocking in &cgu.spec.blocking_crs {
        let Some(blocker) = cgus.get(&blocking.name, &blocking.namespace).await? else {
            debug!(name = %blocking.name, "blocking CGU not found");
            report.missing.push(blocking.name.clone());
            continue;
        };

        let conditions = blocker
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        if conditions.is_empty() {
            report.not_completed.push(blocking.name.clone());
            continue;
        }

        if conditions
            .iter()
            .any(|c| c.reason != UpgradePhase::Completed.as_reason())
        {
            report.not_completed.push(blocking.name.clone());
        }
    }

    debug!(?report, "evaluated blocking CGUs");
    Ok(report)
}
