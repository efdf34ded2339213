//! Mock geocoding and routing providers
//!
//! Serves a Nominatim-like `GET /search` and an OpenRouteService-like
//! `POST /v2/directions/{profile}` on one port, for local runs of the engine.
//!
//! Behavior:
//! - `/search` places every query at a stable point near Chisinau derived from the
//!   query text; languages listed in `--fail-languages` get HTTP 503
//! - `/v2/directions/*` answers with the straight line stretched by `--detour`
//!   driven at `--speed-kmh`, with an encoded two-point geometry
//!
//! Usage:
//!   cargo run --bin mock-providers -- --port 8088 --fail-languages ro

use bytes::Bytes;
use clap::Parser;
use dispatch_engine::domain::{haversine_km, Coordinate};
use dispatch_engine::io::polyline;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const CENTER: (f64, f64) = (47.0105, 28.8638);

#[derive(Parser, Debug, Clone)]
#[command(name = "mock-providers")]
#[command(about = "Mock geocoding and routing providers for local runs")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8088")]
    port: u16,

    /// Comma-separated languages whose searches fail with 503
    #[arg(long, value_delimiter = ',')]
    fail_languages: Vec<String>,

    /// Road distance as a multiple of the straight-line distance
    #[arg(long, default_value = "1.3")]
    detour: f64,

    /// Average driving speed
    #[arg(long, default_value = "35.0")]
    speed_kmh: f64,

    /// Artificial delay added to every response (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// FNV-1a; stable across runs
fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn search(query: &str, args: &Args) -> Response<Full<Bytes>> {
    let language = query_param(query, "accept-language").unwrap_or("");
    if args.fail_languages.iter().any(|l| l == language) {
        warn!(language = %language, "mock_search_failed");
        return respond(StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"unavailable"}"#.to_string());
    }

    let q = query_param(query, "q").unwrap_or("");
    if q.is_empty() {
        return respond(StatusCode::OK, "[]".to_string());
    }

    let hash = fnv1a(q);
    let lat = CENTER.0 + ((hash & 0xffff) as f64 / 65535.0 - 0.5) * 0.08;
    let lon = CENTER.1 + (((hash >> 16) & 0xffff) as f64 / 65535.0 - 0.5) * 0.08;
    let body = serde_json::json!([{
        "lat": format!("{lat:.7}"),
        "lon": format!("{lon:.7}"),
        "display_name": format!("{q}, Chisinau, Moldova"),
        "importance": 0.5,
    }]);
    info!(language = %language, lat, lon, "mock_search");
    respond(StatusCode::OK, body.to_string())
}

fn parse_endpoints(body: &[u8]) -> Option<(Coordinate, Coordinate)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let coords = value.get("coordinates")?.as_array()?;
    let point = |v: &serde_json::Value| -> Option<Coordinate> {
        let pair = v.as_array()?;
        Coordinate::new(pair.get(1)?.as_f64()?, pair.first()?.as_f64()?).ok()
    };
    Some((point(coords.first()?)?, point(coords.last()?)?))
}

fn directions(body: &[u8], args: &Args) -> Response<Full<Bytes>> {
    let Some((from, to)) = parse_endpoints(body) else {
        return respond(StatusCode::BAD_REQUEST, r#"{"error":"bad coordinates"}"#.to_string());
    };

    let distance_km = haversine_km(from, to) * args.detour;
    let duration_s = distance_km / args.speed_kmh.max(1.0) * 3600.0;
    let body = serde_json::json!({
        "routes": [{
            "summary": { "distance": distance_km * 1000.0, "duration": duration_s },
            "geometry": polyline::encode(&[from, to]),
        }]
    });
    info!(from = %from, to = %to, distance_km, "mock_directions");
    respond(StatusCode::OK, body.to_string())
}

async fn handle(req: Request<hyper::body::Incoming>, args: Arc<Args>) -> Result<Response<Full<Bytes>>, Infallible> {
    if args.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.latency_ms)).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    match (method, path.as_str()) {
        (Method::GET, "/search") => Ok(search(&query, &args)),
        (Method::POST, p) if p.starts_with("/v2/directions/") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    error!(error = %e, "mock_body_read_failed");
                    return Ok(respond(StatusCode::BAD_REQUEST, "{}".to_string()));
                }
            };
            Ok(directions(&body, &args))
        }
        _ => Ok(respond(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Arc::new(Args::parse());
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = args.port, fail_languages = ?args.fail_languages, "mock_providers_started");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let args = Arc::clone(&args);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&args)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "mock_http_error");
            }
        });
    }
}
