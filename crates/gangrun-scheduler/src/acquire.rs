//! Bounded-time acquisition of resource bundles

use gangrun_core::{
    format_bundles, GangrunError, GangrunResult, PlacementGroup, PlacementGroupId,
    PlacementPolicy, Resources,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::traits::ClusterScheduler;

/// Reserve `num_bundles` copies of `bundle` under `policy`, waiting at most
/// `timeout` for the scheduler to place them.
///
/// On timeout the pending group is removed and a
/// [`GangrunError::ResourceTimeout`] reports what was asked for and what the
/// cluster had free. Callers own the returned group and release it with
/// [`ClusterScheduler::remove_placement_group`].
pub async fn acquire(
    scheduler: &dyn ClusterScheduler,
    bundle: Resources,
    num_bundles: u32,
    policy: PlacementPolicy,
    timeout: Duration,
) -> GangrunResult<PlacementGroup> {
    let bundles = vec![bundle; num_bundles as usize];

    debug!(
        bundle = %bundle,
        num_bundles,
        policy = %policy,
        timeout_secs = timeout.as_secs_f64(),
        "Requesting placement group"
    );

    let id = scheduler
        .create_placement_group(bundles.clone(), policy)
        .await?;

    match tokio::time::timeout(timeout, scheduler.wait_ready(id)).await {
        Ok(Ok(())) => {
            info!(placement_group = %id, policy = %policy, num_bundles, "Acquired bundles");
            Ok(PlacementGroup {
                id,
                policy,
                bundles,
            })
        }
        Ok(Err(e)) => {
            remove_pending(scheduler, id).await;
            Err(e)
        }
        Err(_) => {
            remove_pending(scheduler, id).await;
            let available = match scheduler.available_resources().await {
                Ok(available) => available.to_string(),
                Err(e) => {
                    warn!(error = %e, "Failed to query available resources");
                    "unknown".to_string()
                }
            };
            warn!(
                placement_group = %id,
                available = %available,
                requested = %format_bundles(&bundles),
                "Placement group was not ready in time"
            );
            Err(GangrunError::ResourceTimeout {
                requested: format_bundles(&bundles),
                available,
                timeout_secs: timeout.as_secs_f64(),
            })
        }
    }
}

async fn remove_pending(scheduler: &dyn ClusterScheduler, id: PlacementGroupId) {
    if let Err(e) = scheduler.remove_placement_group(id).await {
        warn!(placement_group = %id, error = %e, "Failed to remove pending group");
    }
}
