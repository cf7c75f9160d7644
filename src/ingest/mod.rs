use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::rollup::store::SampleStore;
use crate::schedule::ScheduleContext;

/// One raw metric sample.
#[derive(Debug, Deserialize)]
pub struct Sample {
    pub locator: String,
    pub timestamp_ms: u64,
    pub value: f64,
}

/// HTTP ingestion endpoint feeding the sample store and marking slots
/// dirty in the schedule context.
pub struct IngestServer {
    addr: String,
    store: Arc<SampleStore>,
    schedule: Arc<ScheduleContext>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

struct AppState {
    store: Arc<SampleStore>,
    schedule: Arc<ScheduleContext>,
}

impl IngestServer {
    pub fn new(
        addr: &str,
        store: Arc<SampleStore>,
        schedule: Arc<ScheduleContext>,
    ) -> IngestServer {
        IngestServer {
            addr: addr.to_string(),
            store,
            schedule,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving POST /ingest.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            schedule: Arc::clone(&self.schedule),
        });

        let app = Router::new()
            .route("/ingest", post(ingest_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "ingest server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "ingest server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the ingest server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// POST /ingest - Accepts a batch of raw samples.
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(samples): Json<Vec<Sample>>,
) -> impl IntoResponse {
    let accepted = samples.len();

    for sample in samples {
        let key = state
            .store
            .record(&sample.locator, sample.timestamp_ms, sample.value);
        state.schedule.update(sample.timestamp_ms, key.shard);
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": accepted })),
    )
}
