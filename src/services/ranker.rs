//! Two-phase candidate ranking
//!
//! 1. Hard filter (stock / availability), then keep the K closest by haversine.
//! 2. Route the shortlist concurrently (bounded fan-out, per-call timeout) and
//!    order by driving duration, then distance. Unrouted candidates are dropped.

use crate::domain::error::DispatchError;
use crate::domain::geo::haversine_km;
use crate::domain::requirement::StockRequirement;
use crate::domain::types::{
    Coordinate, HasAvailability, HasLocation, RouteResult, TechnicianId, TechnicianRecord,
    WarehouseCandidate,
};
use crate::infra::config::RankingConfig;
use crate::io::route_provider::RouteProvider;
use crate::services::availability::AvailabilityStore;
use crate::services::collaborators::StockDirectory;
use futures::{stream, StreamExt};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type Ranked<T> = Vec<(T, RouteResult)>;

/// Keep the `k` candidates closest to `target` in a straight line
pub fn shortlist<T: HasLocation>(target: Coordinate, candidates: Vec<T>, k: usize) -> Vec<T> {
    let mut by_distance: Vec<(f64, T)> =
        candidates.into_iter().map(|c| (haversine_km(c.location(), target), c)).collect();
    by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
    by_distance.truncate(k);
    by_distance.into_iter().map(|(_, c)| c).collect()
}

fn by_route_cost(a: &RouteResult, b: &RouteResult) -> Ordering {
    a.duration_min.total_cmp(&b.duration_min).then(a.distance_km.total_cmp(&b.distance_km))
}

pub struct CandidateRanker {
    stock: Arc<dyn StockDirectory>,
    availability: Arc<AvailabilityStore>,
    router: Arc<dyn RouteProvider>,
    shortlist_size: usize,
    max_concurrent_routes: usize,
    route_timeout: Duration,
}

impl CandidateRanker {
    pub fn new(
        stock: Arc<dyn StockDirectory>,
        availability: Arc<AvailabilityStore>,
        router: Arc<dyn RouteProvider>,
        config: &RankingConfig,
    ) -> Self {
        Self {
            stock,
            availability,
            router,
            shortlist_size: config.shortlist_size.max(1),
            max_concurrent_routes: config.max_concurrent_routes.max(1),
            route_timeout: config.route_timeout(),
        }
    }

    pub fn router(&self) -> &Arc<dyn RouteProvider> {
        &self.router
    }

    /// Warehouses able to cover `requirement`, routed warehouse -> order
    pub async fn rank_warehouses(
        &self,
        order: Coordinate,
        requirement: &StockRequirement,
    ) -> Result<Ranked<WarehouseCandidate>, DispatchError> {
        let candidates: Vec<WarehouseCandidate> = self
            .stock
            .warehouses_for(requirement)
            .await?
            .into_iter()
            .filter(|w| w.stock_sufficient)
            .collect();
        if candidates.is_empty() {
            return Err(DispatchError::NoStockAvailable);
        }

        let total = candidates.len();
        let short = shortlist(order, candidates, self.shortlist_size);
        let ranked = self.route_and_sort(order, short).await;
        debug!(sufficient = total, routed = ranked.len(), "warehouses_ranked");
        Ok(ranked)
    }

    /// Available technicians, routed technician -> order
    pub async fn rank_technicians(
        &self,
        order: Coordinate,
        count: usize,
    ) -> Result<Ranked<TechnicianRecord>, DispatchError> {
        self.rank_technicians_excluding(order, count, &FxHashSet::default(), &[]).await
    }

    /// Same as `rank_technicians`, skipping ids already lost to contention.
    /// A non-empty `preferred` limits candidates to those ids and routes all of them.
    pub async fn rank_technicians_excluding(
        &self,
        order: Coordinate,
        count: usize,
        excluded: &FxHashSet<TechnicianId>,
        preferred: &[TechnicianId],
    ) -> Result<Ranked<TechnicianRecord>, DispatchError> {
        let candidates: Vec<TechnicianRecord> = self
            .availability
            .get_all()
            .await?
            .into_iter()
            .filter(|t| t.is_available())
            .filter(|t| !excluded.contains(t.id()))
            .filter(|t| preferred.is_empty() || preferred.contains(t.id()))
            .filter(|t| {
                let located = !t.coordinate().is_null_island();
                if !located {
                    debug!(technician_id = %t.id(), "technician_unlocated");
                }
                located
            })
            .collect();
        if candidates.is_empty() {
            return Err(DispatchError::NoTechnicianAvailable { needed: count, found: 0 });
        }

        let total = candidates.len();
        let k = if preferred.is_empty() { self.shortlist_size.max(count) } else { total };
        let short = shortlist(order, candidates, k);
        let ranked = self.route_and_sort(order, short).await;
        debug!(
            available = total,
            routed = ranked.len(),
            needed = count,
            preferred = preferred.len(),
            "technicians_ranked"
        );
        Ok(ranked)
    }

    async fn route_and_sort<T>(&self, order: Coordinate, candidates: Vec<T>) -> Ranked<T>
    where
        T: HasLocation + Send,
    {
        let router = &self.router;
        let timeout = self.route_timeout;

        let mut routed: Vec<(usize, T, RouteResult)> = stream::iter(candidates.into_iter().enumerate())
            .map(|(idx, candidate)| async move {
                let from = candidate.location();
                match tokio::time::timeout(timeout, router.route(from, order)).await {
                    Ok(Some(route)) => Some((idx, candidate, route)),
                    Ok(None) => None,
                    Err(_) => {
                        warn!(from = %from, to = %order, timeout_ms = timeout.as_millis() as u64, "route_timeout");
                        None
                    }
                }
            })
            .buffer_unordered(self.max_concurrent_routes)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        // Shortlist position breaks exact ties so the order is deterministic
        routed.sort_by(|a, b| by_route_cost(&a.2, &b.2).then(a.0.cmp(&b.0)));
        routed.into_iter().map(|(_, c, r)| (c, r)).collect()
    }
}
