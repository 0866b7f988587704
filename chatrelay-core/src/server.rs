//! HTTP listener: one streaming route plus optional CORS headers.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::any,
    Router,
};
use http::{header, HeaderValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, CorsCfg};
use crate::error::{CoreResult, RelayError};
use crate::handler::{self, AppState};

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

pub fn build_router(state: AppState) -> Router {
    let cors = state.cfg.cors.clone();
    let router = Router::new()
        .route(&state.cfg.server.route, any(handler::chat_stream))
        .with_state(state);
    if cors.enabled {
        router.layer(middleware::from_fn_with_state(Arc::new(cors), cors_headers))
    } else {
        router
    }
}

async fn cors_headers(State(cors): State<Arc<CorsCfg>>, req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    match HeaderValue::from_str(&cors.allow_origin) {
        Ok(origin) => {
            h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        Err(_) => warn!(origin = %cors.allow_origin, "cors.allow_origin is not a valid header value"),
    }
    h.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    h.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    resp
}

/// Bind `cfg.server.bind` and serve until `shutdown` fires. Streams already
/// in flight are allowed to finish.
pub async fn serve(cfg: Config, shutdown: CancellationToken) -> CoreResult<()> {
    let bind_addr = cfg.server.bind.clone();
    let route = cfg.server.route.clone();
    let state = AppState::new(cfg)?;
    let router = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        RelayError::Other(anyhow::anyhow!("bind failed on {bind_addr}: {e}"))
    })?;

    info!(%bind_addr, %route, "chatrelay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("chatrelay shut down");
    Ok(())
}
