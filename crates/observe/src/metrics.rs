use {
    anyhow::Result,
    axum::{extract::State, http::StatusCode, routing::get, Router},
    prometheus::{Encoder, Registry, TextEncoder},
    prometheus_metric_storage::StorageRegistry,
    std::{net::SocketAddr, sync::Arc, sync::OnceLock},
};

static REGISTRY: OnceLock<StorageRegistry> = OnceLock::new();

/// Configures the global registry with an optional metric name prefix.
/// Later calls are ignored; [`get_registry`] falls back to an unprefixed
/// registry when setup never ran.
pub fn setup_registry(prefix: Option<String>) {
    let _ = REGISTRY.set(StorageRegistry::new(
        Registry::new_custom(prefix, None).expect("registry prefix must be a valid metric prefix"),
    ));
}

pub fn get_registry() -> &'static StorageRegistry {
    REGISTRY.get_or_init(|| StorageRegistry::new(Registry::new()))
}

/// Criterion for the `/healthz` endpoint.
#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

type Liveness = Arc<dyn LivenessChecking>;

/// Serves `/metrics` and `/healthz` until the process exits.
pub async fn serve(liveness: Liveness, address: SocketAddr) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(liveness);
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&get_registry().gather(), &mut buffer) {
        tracing::error!(?err, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn healthz(State(liveness): State<Liveness>) -> StatusCode {
    if liveness.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
