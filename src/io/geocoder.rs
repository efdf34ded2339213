//! Address geocoding with language fallback
//!
//! `GeoCoder` walks the configured language list, sending each attempt through
//! the shared `AdmissionGate`. Provider failures only cost that language.

use crate::domain::error::{DispatchError, ProviderError};
use crate::domain::types::{Coordinate, GeoResult};
use crate::infra::config::GeocoderConfig;
use crate::infra::metrics::Metrics;
use crate::infra::rate_limiter::AdmissionGate;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Anything that can turn an address into candidate coordinates for one language
#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    async fn search(&self, address: &str, language: &str) -> Result<Vec<GeoResult>, ProviderError>;
}

/// One element of a Nominatim `/search?format=json` response
#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
}

impl NominatimPlace {
    fn into_geo_result(self) -> Option<GeoResult> {
        let lat = self.lat.trim().parse::<f64>().ok()?;
        let lon = self.lon.trim().parse::<f64>().ok()?;
        let coordinate = Coordinate::new(lat, lon).ok()?;
        Some(GeoResult {
            coordinate,
            display_name: self.display_name.unwrap_or_else(|| "Unknown".to_string()),
            importance: self.importance.unwrap_or(0.0),
        })
    }
}

/// Parse a Nominatim response body, skipping entries with bad coordinates
pub(crate) fn parse_search_response(body: &str) -> Result<Vec<GeoResult>, ProviderError> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let total = places.len();
    let results: Vec<GeoResult> =
        places.into_iter().filter_map(NominatimPlace::into_geo_result).collect();
    if results.len() < total {
        warn!(skipped = total - results.len(), "geocode_entries_skipped");
    }
    Ok(results)
}

/// HTTP client for a Nominatim-compatible search endpoint
pub struct NominatimClient {
    http: reqwest::Client,
    search_url: String,
    country_code: String,
    referer: Option<String>,
}

impl NominatimClient {
    pub fn new(config: &GeocoderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ProviderError::from_reqwest)?;

        Ok(Self {
            http,
            search_url: format!("{}/search", config.base_url.trim_end_matches('/')),
            country_code: config.country_code.clone(),
            referer: config.referer.clone().filter(|r| !r.is_empty()),
        })
    }
}

#[async_trait]
impl GeocodingProvider for NominatimClient {
    async fn search(&self, address: &str, language: &str) -> Result<Vec<GeoResult>, ProviderError> {
        let mut request = self.http.get(&self.search_url).query(&[
            ("q", address),
            ("format", "json"),
            ("accept-language", language),
            ("countrycodes", self.country_code.as_str()),
        ]);
        if let Some(referer) = &self.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await.map_err(ProviderError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_reqwest)?;
        if !status.is_success() {
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }

        parse_search_response(&body)
    }
}

/// Highest importance wins; the earliest match wins ties
fn pick_best(matches: impl IntoIterator<Item = GeoResult>) -> Option<GeoResult> {
    matches
        .into_iter()
        .reduce(|best, candidate| if candidate.importance > best.importance { candidate } else { best })
}

pub struct GeoCoder {
    provider: Arc<dyn GeocodingProvider>,
    gate: Arc<AdmissionGate>,
    languages: Vec<String>,
    backoff: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl GeoCoder {
    pub fn new(
        provider: Arc<dyn GeocodingProvider>,
        gate: Arc<AdmissionGate>,
        config: &GeocoderConfig,
    ) -> Self {
        Self {
            provider,
            gate,
            languages: config.languages.clone(),
            backoff: config.backoff(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// First language yielding any match wins
    pub async fn resolve(&self, address: &str) -> Result<GeoResult, DispatchError> {
        if address.trim().is_empty() {
            return Err(self.unavailable(address));
        }

        for (i, language) in self.languages.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.backoff).await;
            }
            if let Ok(matches) = self.attempt(address, language).await {
                if let Some(best) = pick_best(matches) {
                    info!(
                        language = %language,
                        coordinate = %best.coordinate,
                        importance = best.importance,
                        "geocode_resolved"
                    );
                    return Ok(best);
                }
                debug!(language = %language, "geocode_no_match");
            }
        }

        Err(self.unavailable(address))
    }

    /// Query every language and keep the single best match across all of them
    pub async fn resolve_best(&self, address: &str) -> Result<GeoResult, DispatchError> {
        if address.trim().is_empty() {
            return Err(self.unavailable(address));
        }

        let mut collected = Vec::new();
        for (i, language) in self.languages.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.backoff).await;
            }
            if let Ok(matches) = self.attempt(address, language).await {
                collected.extend(matches);
            }
        }

        match pick_best(collected) {
            Some(best) => {
                info!(coordinate = %best.coordinate, importance = best.importance, "geocode_resolved_best");
                Ok(best)
            }
            None => Err(self.unavailable(address)),
        }
    }

    /// One admitted provider call. Errors are logged here and only skip this language.
    async fn attempt(&self, address: &str, language: &str) -> Result<Vec<GeoResult>, DispatchError> {
        let _permit = match self.gate.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_geocode_admission_timeout();
                }
                warn!(language = %language, waited_ms = e.waited_ms, "geocode_admission_timeout");
                return Err(DispatchError::ProviderTimeout(e.to_string()));
            }
        };

        let start = Instant::now();
        let result = self.provider.search(address, language).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.record_geocode(latency_ms, result.is_ok());
        }

        result.map_err(|e| {
            warn!(language = %language, latency_ms, error = %e, "geocode_provider_error");
            DispatchError::from(e)
        })
    }

    fn unavailable(&self, address: &str) -> DispatchError {
        warn!(address = %address, languages = self.languages.len(), "geocode_exhausted");
        DispatchError::GeocodingUnavailable { address: address.to_string() }
    }
}
