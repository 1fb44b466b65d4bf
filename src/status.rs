//! Conflict-retried persistence of CGU state.
//!
//! All status writes funnel through [`update_status`]. A conflict means the
//! stored object moved under us: the wrapper re-reads the latest object,
//! re-applies our computed status on top of it and writes again, so a
//! conflict never escapes the write site. Every other error propagates.

use kube::ResourceExt;
use tracing::debug;

use crate::crd::ClusterGroupUpgrade;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::stores::CguStore;
use crate::{Error, Result};

/// Persist a spec/metadata change (finalizer add/remove) with the same
/// conflict handling as status writes.
pub async fn update_spec(store: &dyn CguStore, cgu: &ClusterGroupUpgrade) -> Result<()> {
    retry_on_conflict(&RetryConfig::for_conflicts(), "update_spec", || {
        let attempt = cgu.clone();
        async move { store.update(&attempt).await }
    })
    .await
}

/// Persist status, refreshing the base object on conflicts.
///
/// On a conflict the latest stored object is fetched, our computed status is
/// applied to it, and the write retried with the fresh resource version.
pub async fn update_status(store: &dyn CguStore, cgu: &ClusterGroupUpgrade) -> Result<()> {
    let name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();

    let mut base = cgu.clone();
    let desired_status = cgu.status.clone();
    let config = RetryConfig::for_conflicts();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match store.update_status(&base).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                debug!(cgu = %name, attempt, "status write conflict, refreshing");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.max_delay);
                let fresh = store.get(&name, &namespace).await?.ok_or_else(|| {
                    Error::child_resource(format!("CGU {namespace}/{name} vanished mid-write"))
                })?;
                base = fresh;
                base.status = desired_status.clone();
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MockCguStore;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    fn cgu(resource_version: &str) -> ClusterGroupUpgrade {
        ClusterGroupUpgrade {
            metadata: ObjectMeta {
                name: Some("cgu-1".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(Default::default()),
        }
    }

    #[tokio::test]
    async fn refresh_retry_rebases_on_the_latest_object() {
        let writes = Arc::new(AtomicU32::new(0));
        let writes_in_mock = writes.clone();

        let mut store = MockCguStore::new();
        store.expect_update_status().returning(move |attempt| {
            if writes_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(attempt.metadata.resource_version.as_deref(), Some("1"));
                Err(conflict())
            } else {
                // The retry must carry the refreshed resource version.
                assert_eq!(attempt.metadata.resource_version.as_deref(), Some("2"));
                Ok(())
            }
        });
        store.expect_get().returning(|_, _| Ok(Some(cgu("2"))));

        update_status(&store, &cgu("1")).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_conflict_errors_propagate_unwrapped() {
        let mut store = MockCguStore::new();
        store
            .expect_update_status()
            .returning(|_| Err(Error::validation("boom")));
        store.expect_get().never();

        let err = update_status(&store, &cgu("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn cgu_deleted_mid_write_is_surfaced() {
        let mut store = MockCguStore::new();
        store.expect_update_status().returning(|_| Err(conflict()));
        store.expect_get().returning(|_, _| Ok(None));

        let err = update_status(&store, &cgu("1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("vanished"));
    }

    #[tokio::test]
    async fn spec_update_retries_conflicts() {
        let writes = Arc::new(AtomicU32::new(0));
        let writes_in_mock = writes.clone();

        let mut store = MockCguStore::new();
        store.expect_update().returning(move |_| {
            if writes_in_mock.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(())
            }
        });

        update_spec(&store, &cgu("1")).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }
}
