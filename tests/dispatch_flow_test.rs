//! End-to-end dispatch tests with in-process providers

use async_trait::async_trait;
use dispatch_engine::domain::{
    haversine_km, Assignment, Coordinate, DispatchError, GeoResult, HasAvailability, OrderId,
    ProviderError, RouteResult, StockRequirement, StoreError, TechnicianId, TechnicianRecord,
    WarehouseCandidate, WarehouseId,
};
use dispatch_engine::infra::config::{DispatchConfig, GeocoderConfig, RankingConfig, StoreConfig};
use dispatch_engine::infra::{AdmissionGate, Metrics};
use dispatch_engine::io::{GeoCoder, GeocodingProvider, InMemoryAvailabilityCache, RouteProvider};
use dispatch_engine::services::{
    AssignmentSink, AvailabilityCache, AvailabilityStore, CandidateRanker, DispatchOrchestrator,
    DispatchRequest, ReserveOutcome, StockDirectory, SyncOutcome,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn coord(lat: f64, lon: f64) -> Coordinate {
    Coordinate::new(lat, lon).unwrap()
}

const ORDER: (f64, f64) = (47.000, 28.800);
const W1: (f64, f64) = (47.002, 28.800);
const W2: (f64, f64) = (47.020, 28.800);

fn order_point() -> Coordinate {
    coord(ORDER.0, ORDER.1)
}

fn kit() -> StockRequirement {
    StockRequirement::new().with_item("sealant", 2).with_item("multimeter", 1)
}

struct FixedGeocoder {
    point: Option<Coordinate>,
}

#[async_trait]
impl GeocodingProvider for FixedGeocoder {
    async fn search(&self, _address: &str, _language: &str) -> Result<Vec<GeoResult>, ProviderError> {
        match self.point {
            Some(coordinate) => Ok(vec![GeoResult {
                coordinate,
                display_name: "Strada Ismail 86, Chisinau".to_string(),
                importance: 0.6,
            }]),
            None => Err(ProviderError::Status { status: 503, body: String::new() }),
        }
    }
}

/// Stock only at W2; W1 is closer but short
struct FixedStock;

#[async_trait]
impl StockDirectory for FixedStock {
    async fn warehouses_for(&self, _: &StockRequirement) -> Result<Vec<WarehouseCandidate>, StoreError> {
        Ok(vec![
            WarehouseCandidate {
                id: WarehouseId::from("w1"),
                name: Some("Centru".into()),
                coordinate: coord(W1.0, W1.1),
                stock_sufficient: false,
            },
            WarehouseCandidate {
                id: WarehouseId::from("w2"),
                name: Some("Botanica".into()),
                coordinate: coord(W2.0, W2.1),
                stock_sufficient: true,
            },
        ])
    }
}

struct EmptyStock;

#[async_trait]
impl StockDirectory for EmptyStock {
    async fn warehouses_for(&self, _: &StockRequirement) -> Result<Vec<WarehouseCandidate>, StoreError> {
        Ok(Vec::new())
    }
}

type RouteFn = dyn Fn(Coordinate, Coordinate) -> Option<f64> + Send + Sync;

/// Technician taken by another order the first time it is routed
type Steal = (Coordinate, TechnicianId, Arc<dyn AvailabilityCache>);

/// Duration in minutes from a closure; distance is the straight line
struct FnRouter {
    minutes: Box<RouteFn>,
    steal: Mutex<Option<Steal>>,
}

impl FnRouter {
    fn new(minutes: impl Fn(Coordinate, Coordinate) -> Option<f64> + Send + Sync + 'static) -> Self {
        Self { minutes: Box::new(minutes), steal: Mutex::new(None) }
    }
}

#[async_trait]
impl RouteProvider for FnRouter {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Option<RouteResult> {
        let steal = {
            let mut slot = self.steal.lock();
            if slot.as_ref().is_some_and(|(at, _, _)| *at == from) {
                slot.take()
            } else {
                None
            }
        };
        if let Some((_, id, cache)) = steal {
            let _ = cache.compare_and_reserve(&id, &OrderId::from("other")).await;
        }

        let duration_min = (self.minutes)(from, to)?;
        Some(RouteResult {
            distance_km: (haversine_km(from, to) * 100.0).round() / 100.0,
            duration_min,
            path: vec![from, to],
            is_via_warehouse: false,
        })
    }
}

/// Technician A is closest in a straight line but across the river
fn river_router() -> FnRouter {
    FnRouter::new(|from, _to| {
        if from.latitude() == 47.005 {
            Some(40.0)
        } else {
            Some(10.0)
        }
    })
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<Assignment>>,
}

#[async_trait]
impl AssignmentSink for RecordingSink {
    async fn record(&self, assignment: &Assignment) -> Result<(), StoreError> {
        self.records.lock().push(assignment.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl AssignmentSink for FailingSink {
    async fn record(&self, _: &Assignment) -> Result<(), StoreError> {
        Err(StoreError::Unreachable("orders db down".into()))
    }
}

struct HangingSink;

#[async_trait]
impl AssignmentSink for HangingSink {
    async fn record(&self, _: &Assignment) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

struct DownCache;

#[async_trait]
impl AvailabilityCache for DownCache {
    async fn get(&self, _: &TechnicianId) -> Result<Option<TechnicianRecord>, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
    async fn list(&self) -> Result<Vec<TechnicianRecord>, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
    async fn sync(&self, _: &TechnicianRecord) -> Result<SyncOutcome, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
    async fn compare_and_reserve(&self, _: &TechnicianId, _: &OrderId) -> Result<ReserveOutcome, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
    async fn release(&self, _: &TechnicianId) -> Result<bool, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
    async fn release_if_held(&self, _: &TechnicianId, _: &OrderId) -> Result<bool, StoreError> {
        Err(StoreError::Unreachable("connection refused".into()))
    }
}

/// In-memory cache whose writes suspend: reserves stall after committing,
/// conditional releases sleep before applying
#[derive(Default)]
struct SuspendingCache {
    inner: InMemoryAvailabilityCache,
    stall_after_reserve: Duration,
    release_delay: Duration,
}

#[async_trait]
impl AvailabilityCache for SuspendingCache {
    async fn get(&self, id: &TechnicianId) -> Result<Option<TechnicianRecord>, StoreError> {
        self.inner.get(id).await
    }
    async fn list(&self) -> Result<Vec<TechnicianRecord>, StoreError> {
        self.inner.list().await
    }
    async fn sync(&self, record: &TechnicianRecord) -> Result<SyncOutcome, StoreError> {
        self.inner.sync(record).await
    }
    async fn compare_and_reserve(&self, id: &TechnicianId, order_id: &OrderId) -> Result<ReserveOutcome, StoreError> {
        let outcome = self.inner.compare_and_reserve(id, order_id).await?;
        tokio::time::sleep(self.stall_after_reserve).await;
        Ok(outcome)
    }
    async fn release(&self, id: &TechnicianId) -> Result<bool, StoreError> {
        self.inner.release(id).await
    }
    async fn release_if_held(&self, id: &TechnicianId, order_id: &OrderId) -> Result<bool, StoreError> {
        tokio::time::sleep(self.release_delay).await;
        self.inner.release_if_held(id, order_id).await
    }
}

/// Technicians A (near, slow route) and B (farther, fast route)
fn crew_a_b() -> Vec<TechnicianRecord> {
    vec![
        TechnicianRecord::available(TechnicianId::from("a"), coord(47.005, 28.800)),
        TechnicianRecord::available(TechnicianId::from("b"), coord(47.030, 28.800)),
    ]
}

struct Harness {
    orchestrator: DispatchOrchestrator,
    store: Arc<AvailabilityStore>,
    metrics: Arc<Metrics>,
}

struct HarnessBuilder {
    cache: Arc<dyn AvailabilityCache>,
    technicians: Vec<TechnicianRecord>,
    geocoded: Option<Coordinate>,
    stock: Arc<dyn StockDirectory>,
    router: Arc<FnRouter>,
    sink: Option<Arc<dyn AssignmentSink>>,
    store_config: StoreConfig,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            cache: Arc::new(InMemoryAvailabilityCache::new()),
            technicians: crew_a_b(),
            geocoded: Some(order_point()),
            stock: Arc::new(FixedStock),
            router: Arc::new(river_router()),
            sink: None,
            store_config: StoreConfig::default(),
        }
    }

    fn technicians(mut self, technicians: Vec<TechnicianRecord>) -> Self {
        self.technicians = technicians;
        self
    }

    fn router(mut self, router: FnRouter) -> Self {
        self.router = Arc::new(router);
        self
    }

    fn sink(mut self, sink: Arc<dyn AssignmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    async fn build(self) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(
            AvailabilityStore::new(self.cache, &self.store_config).with_metrics(Arc::clone(&metrics)),
        );
        let _ = store.sync_roster(&self.technicians).await;

        let geocoder_config =
            GeocoderConfig { languages: vec!["ro".into(), "en".into()], backoff_ms: 0, ..Default::default() };
        let geocoder = Arc::new(
            GeoCoder::new(
                Arc::new(FixedGeocoder { point: self.geocoded }),
                Arc::new(AdmissionGate::from_millis(1000, 0)),
                &geocoder_config,
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let ranking = RankingConfig { route_timeout_ms: 500, ..Default::default() };
        let ranker = Arc::new(CandidateRanker::new(
            self.stock,
            Arc::clone(&store),
            self.router as Arc<dyn RouteProvider>,
            &ranking,
        ));

        let mut orchestrator =
            DispatchOrchestrator::new(geocoder, ranker, Arc::clone(&store), &DispatchConfig::default())
                .with_metrics(Arc::clone(&metrics));
        if let Some(sink) = self.sink {
            orchestrator = orchestrator.with_sink(sink);
        }
        Harness { orchestrator, store, metrics }
    }
}

impl Harness {
    async fn dispatch(&self, order: &str, crew_size: usize) -> Result<Assignment, DispatchError> {
        self.orchestrator.dispatch(OrderId::from(order), "Strada Ismail 86", &kit(), crew_size).await
    }

    async fn is_available(&self, id: &str) -> bool {
        self.store.get(&TechnicianId::from(id)).await.unwrap().unwrap().is_available()
    }
}

#[tokio::test]
async fn test_ranks_by_route_duration_not_straight_line() {
    let sink = Arc::new(RecordingSink::default());
    let harness = HarnessBuilder::new().sink(sink.clone()).build().await;

    let assignment = harness.dispatch("o1", 1).await.unwrap();

    assert_eq!(assignment.warehouse_id, WarehouseId::from("w2"));
    let b = TechnicianId::from("b");
    assert_eq!(assignment.technician_ids.iter().collect::<Vec<_>>(), vec![&b]);

    // Lead technician goes b -> w2 -> order
    let route = &assignment.routes_by_technician[&b];
    assert!(route.is_via_warehouse);
    assert_eq!(route.duration_min, 20.0);
    assert_eq!(route.path.first(), Some(&coord(47.030, 28.800)));
    assert_eq!(route.path.last(), Some(&order_point()));

    assert!(harness.is_available("a").await);
    let b_record = harness.store.get(&b).await.unwrap().unwrap();
    assert_eq!(b_record.current_order_id(), Some(&OrderId::from("o1")));

    assert_eq!(sink.records.lock().len(), 1);
    assert_eq!(sink.records.lock()[0].dispatch_id, assignment.dispatch_id);
    assert_eq!(harness.metrics.dispatches_total(), 1);
}

#[tokio::test]
async fn test_crew_of_two_keeps_direct_routes_for_followers() {
    let harness = HarnessBuilder::new().build().await;

    let assignment = harness.dispatch("o1", 2).await.unwrap();
    assert_eq!(assignment.technician_ids.len(), 2);

    let follower = &assignment.routes_by_technician[&TechnicianId::from("a")];
    assert!(!follower.is_via_warehouse);
    assert_eq!(follower.duration_min, 40.0);
    assert!(!harness.is_available("a").await);
    assert!(!harness.is_available("b").await);
}

#[tokio::test]
async fn test_via_route_failure_releases_reservations() {
    let w2 = coord(W2.0, W2.1);
    let router = FnRouter::new(move |from, to| {
        if to == w2 && from != w2 {
            None
        } else {
            Some(if from.latitude() == 47.005 { 40.0 } else { 10.0 })
        }
    });
    let harness = HarnessBuilder::new().router(router).build().await;

    let err = harness.dispatch("o1", 2).await.unwrap_err();

    assert!(matches!(err, DispatchError::NoRouteFound(_)));
    assert!(harness.is_available("a").await);
    assert!(harness.is_available("b").await);
    assert_eq!(harness.metrics.compensations(), 1);
    assert_eq!(harness.metrics.reservations_released(), 2);
}

#[tokio::test]
async fn test_sink_failure_releases_reservations() {
    let harness = HarnessBuilder::new().sink(Arc::new(FailingSink)).build().await;

    let err = harness.dispatch("o1", 1).await.unwrap_err();

    assert!(matches!(err, DispatchError::StoreUnavailable(_)));
    assert!(harness.is_available("b").await);
}

#[tokio::test]
async fn test_short_crew_reserves_nobody() {
    let harness = HarnessBuilder::new().build().await;

    let err = harness.dispatch("o1", 3).await.unwrap_err();

    assert_eq!(err, DispatchError::NoTechnicianAvailable { needed: 3, found: 2 });
    assert!(harness.is_available("a").await);
    assert!(harness.is_available("b").await);
    assert_eq!(harness.metrics.reservations_won(), 0);
}

#[tokio::test]
async fn test_unroutable_technicians_are_not_candidates() {
    let router = FnRouter::new(|from, _| if from.latitude() == 47.030 { None } else { Some(5.0) });
    let harness = HarnessBuilder::new().router(router).build().await;

    let err = harness.dispatch("o1", 2).await.unwrap_err();
    assert_eq!(err, DispatchError::NoTechnicianAvailable { needed: 2, found: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatches_share_one_technician() {
    let only = vec![TechnicianRecord::available(TechnicianId::from("solo"), coord(47.01, 28.80))];
    let harness = Arc::new(HarnessBuilder::new().technicians(only).build().await);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.dispatch(&format!("o{i}"), 1).await })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(DispatchError::NoTechnicianAvailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert!(!harness.is_available("solo").await);
}

#[tokio::test]
async fn test_contended_technician_is_skipped_on_retry() {
    let cache: Arc<dyn AvailabilityCache> = Arc::new(InMemoryAvailabilityCache::new());
    let router = river_router();
    // b is ranked first, then taken by another order before this dispatch reserves it
    *router.steal.lock() = Some((coord(47.030, 28.800), TechnicianId::from("b"), Arc::clone(&cache)));

    let mut builder = HarnessBuilder::new().router(router);
    builder.cache = cache;
    let harness = builder.build().await;

    let assignment = harness.dispatch("o1", 1).await.unwrap();

    let a = TechnicianId::from("a");
    assert_eq!(assignment.technician_ids.iter().collect::<Vec<_>>(), vec![&a]);
    assert_eq!(assignment.routes_by_technician[&a].duration_min, 50.0);

    let b = harness.store.get(&TechnicianId::from("b")).await.unwrap().unwrap();
    assert_eq!(b.current_order_id(), Some(&OrderId::from("other")));
    assert_eq!(harness.metrics.snapshot().reservations_conflicted, 1);
}

#[tokio::test]
async fn test_cancelled_dispatch_releases_reservations() {
    let harness = HarnessBuilder::new().sink(Arc::new(HangingSink)).build().await;

    let outcome = tokio::time::timeout(Duration::from_millis(200), harness.dispatch("o1", 2)).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.is_available("a").await);
    assert!(harness.is_available("b").await);
    assert_eq!(harness.metrics.compensations(), 1);
}

#[tokio::test]
async fn test_abort_during_compensation_still_releases_everyone() {
    let mut builder = HarnessBuilder::new().sink(Arc::new(FailingSink));
    builder.cache = Arc::new(SuspendingCache { release_delay: Duration::from_millis(100), ..Default::default() });
    let harness = builder.build().await;

    // Sink fails at once; the timeout fires while the first release is sleeping
    let outcome = tokio::time::timeout(Duration::from_millis(50), harness.dispatch("o1", 2)).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(harness.is_available("a").await);
    assert!(harness.is_available("b").await);
    assert_eq!(harness.metrics.reservations_released(), 2);
    assert_eq!(harness.metrics.compensations(), 1);
}

#[tokio::test]
async fn test_reserve_timeout_after_commit_is_released() {
    let mut builder = HarnessBuilder::new();
    builder.cache = Arc::new(SuspendingCache { stall_after_reserve: Duration::from_millis(500), ..Default::default() });
    builder.store_config = StoreConfig { op_timeout_ms: 30, ..Default::default() };
    let harness = builder.build().await;

    let err = harness.dispatch("o1", 1).await.unwrap_err();

    assert!(matches!(err, DispatchError::ProviderTimeout(_)));
    let b = harness.store.get(&TechnicianId::from("b")).await.unwrap().unwrap();
    assert!(b.is_available());
    assert_eq!(b.current_order_id(), None);
    assert!(harness.is_available("a").await);
    assert_eq!(harness.metrics.reservations_released(), 1);
}

#[tokio::test]
async fn test_preferred_technicians_override_route_ranking() {
    let harness = HarnessBuilder::new().build().await;
    let request = DispatchRequest::new(OrderId::from("o1"), "Strada Ismail 86", kit(), 1)
        .with_preferred_technicians(vec![TechnicianId::from("a")]);

    let assignment = harness.orchestrator.dispatch_request(&request).await.unwrap();

    let a = TechnicianId::from("a");
    assert_eq!(assignment.technician_ids.iter().collect::<Vec<_>>(), vec![&a]);
    assert!(harness.is_available("b").await);

    let again = DispatchRequest::new(OrderId::from("o2"), "Strada Ismail 86", kit(), 1)
        .with_preferred_technicians(vec![TechnicianId::from("a")]);
    let err = harness.orchestrator.dispatch_request(&again).await.unwrap_err();
    assert_eq!(err, DispatchError::NoTechnicianAvailable { needed: 1, found: 0 });
    assert!(harness.is_available("b").await);
}

#[tokio::test]
async fn test_no_stock_anywhere() {
    let mut builder = HarnessBuilder::new();
    builder.stock = Arc::new(EmptyStock);
    let harness = builder.build().await;

    assert_eq!(harness.dispatch("o1", 1).await.unwrap_err(), DispatchError::NoStockAvailable);
    assert_eq!(harness.metrics.reservations_won(), 0);
}

#[tokio::test]
async fn test_geocoding_exhausted() {
    let mut builder = HarnessBuilder::new();
    builder.geocoded = None;
    let harness = builder.build().await;

    let err = harness.dispatch("o1", 1).await.unwrap_err();
    assert!(matches!(err, DispatchError::GeocodingUnavailable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_store_down_is_typed_error() {
    let mut builder = HarnessBuilder::new();
    builder.cache = Arc::new(DownCache);
    let harness = builder.build().await;

    let err = harness.dispatch("o1", 1).await.unwrap_err();
    assert!(matches!(err, DispatchError::StoreUnavailable(_)));
}

#[tokio::test]
async fn test_invalid_request_makes_no_calls() {
    let harness = HarnessBuilder::new().build().await;

    let err = harness
        .orchestrator
        .dispatch(OrderId::from("o1"), "Strada Ismail 86", &StockRequirement::new(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRequest(_)));

    let err = harness.dispatch("o1", 0).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRequest(_)));
    assert_eq!(harness.metrics.snapshot().geocode_requests, 0);
}
