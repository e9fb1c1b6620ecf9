mod config;
mod definition;
mod dispatcher;
mod handlers;
mod influx;
mod lifecycle;
mod retry;
mod signature;
mod smartthings;
mod weather;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

use dispatcher::{DispatchError, Dispatcher};
use handlers::Services;
use influx::Influx;
use retry::RetryPolicy;
use signature::{KeyStore, SignatureVerifier};
use weather::Weather;

// Lifecycle payloads are small; anything larger is not SmartThings
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    /// Absent only when signature checks are disabled in config.
    pub verifier: Option<Arc<SignatureVerifier>>,
    pub dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (development); in production, systemd
    // provides environment variables via EnvironmentFile.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .without_time()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_track=info,tower_http=info".into()),
        )
        .init();

    let config = config::load()?;
    let definition = Arc::new(definition::load()?);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()?;
    let retry = RetryPolicy::default();

    let services = Arc::new(Services {
        http: http.clone(),
        retry,
        smartthings_base_url: config.smartthings.base_url.clone(),
        weather: Weather::new(config.weather.base_url.clone(), http.clone(), retry),
        influx: Influx::new(
            config.influxdb.url.clone(),
            config.influxdb.org.clone(),
            config.influxdb.bucket.clone(),
            config.influxdb.token.clone(),
            http.clone(),
            retry,
        ),
    });

    let verifier = if config.dispatcher.check_signatures {
        let keys = KeyStore::new(config.dispatcher.keyserver_url.clone(), http, retry);
        Some(Arc::new(SignatureVerifier::new(
            keys,
            definition.target_path().to_string(),
            config.dispatcher.clock_skew_sec,
        )))
    } else {
        warn!("signature checks are DISABLED; lifecycle requests are unauthenticated");
        None
    };

    let dispatcher = Arc::new(Dispatcher::new(handlers::handler_map(
        definition.clone(),
        services,
        config.smartthings.oauth.clone(),
    )));

    // route on the target URL's path; any query string only matters for
    // signature verification
    let webhook_path = definition
        .target_path()
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    let app = router(&webhook_path, AppState { verifier, dispatcher });

    let addr = &config.server.bind;
    info!(%addr, path = %webhook_path, "sensor-track listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}

fn router(webhook_path: &str, state: AppState) -> Router {
    Router::new()
        .route(webhook_path, post(handle_lifecycle))
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let client_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.split(',').next())
                        .map(|s| s.trim().to_string())
                        .unwrap_or_else(|| "-".into());
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        client_ip = %client_ip,
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// POST endpoint for all lifecycle phases. The body is taken as raw bytes
/// because the signature covers the exact bytes on the wire, not any
/// re-serialization of them.
async fn handle_lifecycle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(verifier) = &state.verifier {
        if let Err(error) = verifier.verify(&body, &headers).await {
            warn!(error = %error, "rejected unauthenticated lifecycle request");
            return error_response(StatusCode::UNAUTHORIZED, "signature verification failed");
        }
    }

    let request = match lifecycle::decode(&body) {
        Ok(request) => request,
        Err(error) => {
            warn!(error = %error, "rejected undecodable lifecycle request");
            return error_response(StatusCode::BAD_REQUEST, &error.to_string());
        }
    };

    match state.dispatcher.dispatch(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(error @ DispatchError::UnknownPage(_)) => {
            warn!(error = %error, "rejected configuration page request");
            error_response(StatusCode::BAD_REQUEST, &error.to_string())
        }
        Err(error) => {
            error!(
                execution_id = %request.execution_id(),
                error = format!("{error:#}"),
                "lifecycle request failed"
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Error bodies are JSON like everything else on this surface. Details of
/// internal faults stay in the logs, not the response.
fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "OK"}))
}

async fn handle_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
