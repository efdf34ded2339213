//! End-to-end dispatch of one order
//!
//! geocode -> rank warehouses -> rank technicians -> reserve crew -> assemble -> record.
//! Every reservation made during a call is tracked by a `ReservationLedger`; any
//! failure after the first reservation releases all of them before returning, and a
//! dropped dispatch future releases them from the ledger's `Drop`.

use crate::domain::error::DispatchError;
use crate::domain::requirement::StockRequirement;
use crate::domain::types::{
    Assignment, Coordinate, GeoResult, OrderId, RouteResult, TechnicianId, TechnicianRecord,
    WarehouseCandidate,
};
use crate::infra::config::DispatchConfig;
use crate::infra::metrics::Metrics;
use crate::io::geocoder::GeoCoder;
use crate::services::availability::AvailabilityStore;
use crate::services::collaborators::AssignmentSink;
use crate::services::ranker::CandidateRanker;
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One order to dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub order_id: OrderId,
    pub address: String,
    pub requirement: StockRequirement,
    pub crew_size: usize,
    /// When non-empty, the crew is chosen only from these technicians
    pub preferred_technicians: Vec<TechnicianId>,
}

impl DispatchRequest {
    pub fn new(
        order_id: OrderId,
        address: impl Into<String>,
        requirement: StockRequirement,
        crew_size: usize,
    ) -> Self {
        Self {
            order_id,
            address: address.into(),
            requirement,
            crew_size,
            preferred_technicians: Vec::new(),
        }
    }

    pub fn with_preferred_technicians(mut self, ids: Vec<TechnicianId>) -> Self {
        self.preferred_technicians = ids;
        self
    }

    fn validate(&self) -> Result<(), DispatchError> {
        if self.order_id.as_str().trim().is_empty() {
            return Err(DispatchError::InvalidRequest("empty order id".into()));
        }
        if self.address.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("empty address".into()));
        }
        if self.crew_size == 0 {
            return Err(DispatchError::InvalidRequest("crew size must be at least 1".into()));
        }
        if self.requirement.is_empty() {
            return Err(DispatchError::InvalidRequest("empty stock requirement".into()));
        }
        if !self.preferred_technicians.is_empty() {
            let distinct: BTreeSet<&TechnicianId> = self.preferred_technicians.iter().collect();
            if distinct.len() < self.crew_size {
                return Err(DispatchError::InvalidRequest(format!(
                    "{} preferred technicians for a crew of {}",
                    distinct.len(),
                    self.crew_size
                )));
            }
        }
        Ok(())
    }
}

/// Technicians one dispatch call may hold and has not committed yet.
///
/// An id is pushed before its reserve is awaited and removed only once a release
/// attempt for it has completed, so a lost reply or a dropped future still leaves
/// it here for `Drop`. Releases are conditional on this order holding the record.
struct ReservationLedger {
    store: Arc<AvailabilityStore>,
    metrics: Option<Arc<Metrics>>,
    order_id: OrderId,
    held: Vec<TechnicianId>,
}

impl ReservationLedger {
    fn new(store: Arc<AvailabilityStore>, metrics: Option<Arc<Metrics>>, order_id: OrderId) -> Self {
        Self { store, metrics, order_id, held: Vec::new() }
    }

    fn push(&mut self, id: TechnicianId) {
        self.held.push(id);
    }

    /// Drop an id whose reserve was answered with a refusal
    fn forget(&mut self, id: &TechnicianId) {
        self.held.retain(|held| held != id);
    }

    fn len(&self) -> usize {
        self.held.len()
    }

    /// Release everything held so far. Release failures are logged, not retried.
    async fn compensate(&mut self) {
        if self.held.is_empty() {
            return;
        }

        let mut released = 0;
        while let Some(id) = self.held.first().cloned() {
            match self.store.release_held(&id, &self.order_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(order_id = %self.order_id, technician_id = %id, error = %e, "compensation_release_failed");
                }
            }
            self.held.remove(0);
        }
        if let Some(m) = &self.metrics {
            m.record_compensation();
        }
        info!(order_id = %self.order_id, released, "reservations_compensated");
    }

    /// Keep the reservations; nothing is released on drop afterwards
    fn commit(mut self) {
        self.held.clear();
    }
}

impl Drop for ReservationLedger {
    fn drop(&mut self) {
        let ids = std::mem::take(&mut self.held);
        if ids.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(order_id = %self.order_id, technicians = ids.len(), "reservations_leaked_no_runtime");
            return;
        };

        warn!(order_id = %self.order_id, technicians = ids.len(), "dispatch_aborted_releasing");
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let order_id = self.order_id.clone();
        handle.spawn(async move {
            for id in &ids {
                if let Err(e) = store.release_held(id, &order_id).await {
                    error!(order_id = %order_id, technician_id = %id, error = %e, "compensation_release_failed");
                }
            }
            if let Some(m) = metrics {
                m.record_compensation();
            }
        });
    }
}

pub struct DispatchOrchestrator {
    geocoder: Arc<GeoCoder>,
    ranker: Arc<CandidateRanker>,
    store: Arc<AvailabilityStore>,
    sink: Option<Arc<dyn AssignmentSink>>,
    config: DispatchConfig,
    metrics: Option<Arc<Metrics>>,
}

impl DispatchOrchestrator {
    pub fn new(
        geocoder: Arc<GeoCoder>,
        ranker: Arc<CandidateRanker>,
        store: Arc<AvailabilityStore>,
        config: &DispatchConfig,
    ) -> Self {
        Self { geocoder, ranker, store, sink: None, config: config.clone(), metrics: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AssignmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn dispatch(
        &self,
        order_id: OrderId,
        address: &str,
        requirement: &StockRequirement,
        crew_size: usize,
    ) -> Result<Assignment, DispatchError> {
        let request = DispatchRequest::new(order_id, address, requirement.clone(), crew_size);
        self.dispatch_request(&request).await
    }

    pub async fn dispatch_request(&self, request: &DispatchRequest) -> Result<Assignment, DispatchError> {
        let start = Instant::now();
        info!(
            order_id = %request.order_id,
            crew_size = request.crew_size,
            items = request.requirement.len(),
            preferred = request.preferred_technicians.len(),
            "dispatch_started"
        );

        let result = self.run(request).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.record_dispatch(latency_ms, result.as_ref().map(|_| ()));
        }

        match &result {
            Ok(assignment) => info!(
                dispatch_id = %assignment.dispatch_id,
                order_id = %assignment.order_id,
                warehouse_id = %assignment.warehouse_id,
                technicians = assignment.technician_ids.len(),
                latency_ms,
                "dispatch_completed"
            ),
            Err(e) => warn!(
                order_id = %request.order_id,
                kind = e.kind(),
                error = %e,
                latency_ms,
                "dispatch_failed"
            ),
        }
        result
    }

    async fn run(&self, request: &DispatchRequest) -> Result<Assignment, DispatchError> {
        request.validate()?;

        let location = self.geocoder.resolve(&request.address).await?;
        let order = location.coordinate;

        let (warehouse, warehouse_route) = self
            .ranker
            .rank_warehouses(order, &request.requirement)
            .await?
            .into_iter()
            .next()
            .ok_or(DispatchError::NoStockAvailable)?;
        debug!(
            order_id = %request.order_id,
            warehouse_id = %warehouse.id,
            duration_min = warehouse_route.duration_min,
            "warehouse_selected"
        );

        let mut ledger = ReservationLedger::new(
            Arc::clone(&self.store),
            self.metrics.clone(),
            request.order_id.clone(),
        );

        let crew = match self.reserve_crew(&mut ledger, request, order).await {
            Ok(crew) => crew,
            Err(e) => {
                ledger.compensate().await;
                return Err(e);
            }
        };

        match self.assemble_and_record(request, location, &warehouse, crew).await {
            Ok(assignment) => {
                ledger.commit();
                Ok(assignment)
            }
            Err(e) => {
                ledger.compensate().await;
                Err(e)
            }
        }
    }

    /// Reserve `crew_size` technicians, re-ranking without contended ones on conflict
    async fn reserve_crew(
        &self,
        ledger: &mut ReservationLedger,
        request: &DispatchRequest,
        order: Coordinate,
    ) -> Result<Vec<(TechnicianRecord, RouteResult)>, DispatchError> {
        let needed = request.crew_size;
        let attempts = self.config.max_reservation_attempts.max(1);
        let mut excluded: FxHashSet<TechnicianId> = FxHashSet::default();
        let mut secured = 0;

        for attempt in 1..=attempts {
            let mut ranked = self
                .ranker
                .rank_technicians_excluding(order, needed, &excluded, &request.preferred_technicians)
                .await?;
            if ranked.len() < needed {
                return Err(DispatchError::NoTechnicianAvailable { needed, found: ranked.len() });
            }
            ranked.truncate(needed);

            match self.reserve_all(ledger, &request.order_id, &ranked).await {
                Ok(()) => return Ok(ranked),
                Err(DispatchError::ReservationConflict(id)) => {
                    secured = ledger.len();
                    info!(
                        order_id = %request.order_id,
                        technician_id = %id,
                        attempt,
                        attempts,
                        "reservation_conflict"
                    );
                    ledger.compensate().await;
                    excluded.insert(id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::NoTechnicianAvailable { needed, found: secured })
    }

    async fn reserve_all(
        &self,
        ledger: &mut ReservationLedger,
        order_id: &OrderId,
        crew: &[(TechnicianRecord, RouteResult)],
    ) -> Result<(), DispatchError> {
        for (tech, _) in crew {
            // A timed-out reserve may still have committed, so the id is held until released
            ledger.push(tech.id().clone());
            if !self.store.reserve(tech.id(), order_id).await? {
                ledger.forget(tech.id());
                return Err(DispatchError::ReservationConflict(tech.id().clone()));
            }
        }
        Ok(())
    }

    async fn assemble_and_record(
        &self,
        request: &DispatchRequest,
        location: GeoResult,
        warehouse: &WarehouseCandidate,
        crew: Vec<(TechnicianRecord, RouteResult)>,
    ) -> Result<Assignment, DispatchError> {
        let mut technician_ids = BTreeSet::new();
        let mut routes_by_technician = BTreeMap::new();

        for (i, (tech, direct)) in crew.into_iter().enumerate() {
            let route = if i == 0 && self.config.lead_via_warehouse {
                self.ranker
                    .router()
                    .route_via(tech.coordinate(), &[warehouse.coordinate], location.coordinate)
                    .await
                    .ok_or_else(|| {
                        DispatchError::NoRouteFound(format!(
                            "technician {} via warehouse {}",
                            tech.id(),
                            warehouse.id
                        ))
                    })?
            } else {
                direct
            };
            technician_ids.insert(tech.id().clone());
            routes_by_technician.insert(tech.id().clone(), route);
        }

        let assignment = Assignment {
            dispatch_id: uuid::Uuid::now_v7().to_string(),
            order_id: request.order_id.clone(),
            order_location: location,
            warehouse_id: warehouse.id.clone(),
            technician_ids,
            routes_by_technician,
            created_at: chrono::Utc::now(),
        };

        if let Some(sink) = &self.sink {
            sink.record(&assignment)
                .await
                .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        }
        Ok(assignment)
    }
}
