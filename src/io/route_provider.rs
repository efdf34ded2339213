//! Driving routes from an OpenRouteService-compatible directions API

use crate::domain::error::ProviderError;
use crate::domain::geo::round2;
use crate::domain::types::{Coordinate, RouteResult};
use crate::infra::config::RoutingConfig;
use crate::infra::metrics::Metrics;
use crate::io::polyline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Provider durations are padded by this factor to account for traffic
pub const TRAFFIC_BUFFER: f64 = 1.2;

#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Route between two points, `None` when the provider cannot supply one
    async fn route(&self, from: Coordinate, to: Coordinate) -> Option<RouteResult>;

    /// Chain `from -> via[0] -> ... -> to`. Any failed leg fails the whole route.
    async fn route_via(
        &self,
        from: Coordinate,
        via: &[Coordinate],
        to: Coordinate,
    ) -> Option<RouteResult> {
        let mut stops = Vec::with_capacity(via.len() + 2);
        stops.push(from);
        stops.extend_from_slice(via);
        stops.push(to);

        let mut distance_km = 0.0;
        let mut duration_min = 0.0;
        let mut path: Vec<Coordinate> = Vec::new();
        for leg in stops.windows(2) {
            let Some(route) = self.route(leg[0], leg[1]).await else {
                debug!(from = %leg[0], to = %leg[1], "route_leg_failed");
                return None;
            };
            distance_km += route.distance_km;
            duration_min += route.duration_min;
            let skip = usize::from(path.last().is_some() && path.last() == route.path.first());
            path.extend(route.path.into_iter().skip(skip));
        }

        Some(RouteResult {
            distance_km: round2(distance_km),
            duration_min: round2(duration_min),
            path,
            is_via_warehouse: true,
        })
    }
}

#[derive(Debug, Serialize)]
struct DirectionsOptions<'a> {
    avoid_features: &'a [String],
}

#[derive(Debug, Serialize)]
struct DirectionsRequest<'a> {
    /// [lon, lat] pairs
    coordinates: [[f64; 2]; 2],
    profile: &'a str,
    format: &'static str,
    geometry: bool,
    options: DirectionsOptions<'a>,
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    summary: RouteSummary,
    geometry: String,
}

#[derive(Debug, Deserialize)]
struct RouteSummary {
    /// Metres; omitted by the provider for zero-length routes
    #[serde(default)]
    distance: f64,
    /// Seconds
    #[serde(default)]
    duration: f64,
}

/// Convert a provider response body into a route
pub(crate) fn parse_directions_response(body: &str) -> Result<RouteResult, ProviderError> {
    let response: DirectionsResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("empty route list".to_string()))?;
    let path =
        polyline::decode(&route.geometry).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    Ok(RouteResult {
        distance_km: round2(route.summary.distance / 1000.0),
        duration_min: round2(route.summary.duration * TRAFFIC_BUFFER / 60.0),
        path,
        is_via_warehouse: false,
    })
}

pub struct OpenRouteServiceClient {
    http: reqwest::Client,
    directions_url: String,
    profile: String,
    api_key: String,
    avoid_features: Vec<String>,
    metrics: Option<Arc<Metrics>>,
}

impl OpenRouteServiceClient {
    pub fn new(config: &RoutingConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ProviderError::from_reqwest)?;

        let api_key = config.resolved_api_key();
        if api_key.is_empty() {
            warn!("routing_api_key_missing");
        }

        Ok(Self {
            http,
            directions_url: format!(
                "{}/v2/directions/{}",
                config.base_url.trim_end_matches('/'),
                config.profile
            ),
            profile: config.profile.clone(),
            api_key,
            avoid_features: config.avoid_features.clone(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn request(&self, from: Coordinate, to: Coordinate) -> Result<RouteResult, ProviderError> {
        let body = DirectionsRequest {
            coordinates: [[from.longitude(), from.latitude()], [to.longitude(), to.latitude()]],
            profile: &self.profile,
            format: "json",
            geometry: true,
            options: DirectionsOptions { avoid_features: &self.avoid_features },
        };

        let response = self
            .http
            .post(&self.directions_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(ProviderError::from_reqwest)?;
        if !status.is_success() {
            return Err(ProviderError::Status { status: status.as_u16(), body: text });
        }

        parse_directions_response(&text)
    }
}

#[async_trait]
impl RouteProvider for OpenRouteServiceClient {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Option<RouteResult> {
        let start = Instant::now();
        let result = self.request(from, to).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.record_route(latency_ms, result.is_ok());
        }

        match result {
            Ok(route) => {
                debug!(
                    from = %from,
                    to = %to,
                    distance_km = route.distance_km,
                    duration_min = route.duration_min,
                    latency_ms,
                    "route_found"
                );
                Some(route)
            }
            Err(e) => {
                warn!(from = %from, to = %to, latency_ms, error = %e, "route_provider_error");
                None
            }
        }
    }
}
