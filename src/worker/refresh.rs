use crate::{id::NodeId, routing::RoutingTable};
use rand::Rng;
use std::time::{Duration, Instant};

/// How often idle buckets and quarantined nodes are looked at.
pub(crate) const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Pick a `find_node` target for every bucket that has been idle for `period`. Each target falls
/// into its bucket. The buckets are marked refreshed right away so that a slow refresh does not
/// get started twice.
pub(crate) fn refresh_targets<R: Rng + ?Sized>(
    table: &mut RoutingTable,
    period: Duration,
    now: Instant,
    rng: &mut R,
) -> Vec<NodeId> {
    let indices = table.buckets_to_refresh(period, now);

    if !indices.is_empty() {
        log::debug!("Refreshing {} idle buckets", indices.len());
    }

    indices
        .into_iter()
        .map(|index| {
            table.mark_refreshed(index, now);
            table.random_id_in_bucket(index, rng)
        })
        .collect()
}
