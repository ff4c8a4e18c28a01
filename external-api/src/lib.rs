//! # Admin API & Healthcheck
//!
//! This crate provides the http api for allocating addresses, plus
//! healthcheck, diagnostics, and metrics.
//! It exposes the following endpoints:
//!
//! POST /allocate
//! POST /release
//! POST /renew
//! GET /leases
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /config
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{Router, extract::Extension, http::StatusCode, routing};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, trace};

use config::IpamConfig;
use ip_manager::{Allocator, LeaseStore};

pub use crate::models::{Health, State};

/// default bound on a single api request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    token: CancellationToken,
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.token.cancel();
        self.task_handle.abort();
    }
}

/// Serves the allocator over HTTP & listens for health changes
#[derive(Debug)]
pub struct ExternalApi<S> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    alloc: Arc<Allocator<S>>,
    cfg: Arc<IpamConfig>,
    timeout: Duration,
}

impl<S: LeaseStore> ExternalApi<S> {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, cfg: Arc<IpamConfig>, alloc: Arc<Allocator<S>>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            alloc,
            cfg,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// bound every request to `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    fn router(
        state: State,
        cfg: Arc<IpamConfig>,
        alloc: Arc<Allocator<S>>,
        timeout: Duration,
    ) -> Router {
        Router::new()
            .route("/allocate", routing::post(handlers::allocate::<S>))
            .route("/release", routing::post(handlers::release::<S>))
            .route("/renew", routing::post(handlers::renew::<S>))
            .route("/leases", routing::get(handlers::leases::<S>))
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/config", routing::get(handlers::config))
            .layer(Extension(state))
            .layer(Extension(alloc))
            .layer(Extension(cfg))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                timeout,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// serve the HTTP api until `token` is cancelled
    async fn run(addr: SocketAddr, app: Router, token: CancellationToken) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        info!(%addr, "admin API listening");

        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        info!("admin API shut down");
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes. The task ends when `token` is cancelled
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let Self {
            tx,
            rx,
            addr,
            state,
            alloc,
            cfg,
            timeout,
        } = self;
        // the status listener ends once every sender is gone
        drop(tx);
        let app = Self::router(state.clone(), cfg, alloc, timeout);

        tokio::spawn(async move {
            // once every sender is gone the last reported health sticks
            let status = tokio::spawn(listen_status(rx, state));
            if let Err(err) = ExternalApi::<S>::run(addr, app, token.clone()).await {
                error!(?err, "admin API task returning, this should not happen");
                token.cancel();
            }
            status.abort();
        })
    }

    /// Start the api, stopping it when the guard is dropped
    pub fn serve(self) -> ExternalApiGuard {
        let token = CancellationToken::new();
        ExternalApiGuard {
            task_handle: self.start(token.clone()),
            token,
        }
    }
}

/// Listen to Health changes over the channel
async fn listen_status(mut rx: mpsc::Receiver<Health>, state: State) {
    while let Some(health) = rx.recv().await {
        let mut guard = state.lock();
        if *guard != health {
            info!(%health, "health changed");
            *guard = health;
        }
    }
    info!("listen health exited-- nothing listening");
}

mod handlers {

    use std::{net::Ipv4Addr, sync::Arc, time::Duration};

    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use chrono::{DateTime, Utc};
    use config::IpamConfig;
    use ip_manager::{Allocator, Lease, LeaseStore};
    use ipam_core::metrics::{API_REQUEST_DURATION, update_uptime};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use serde::{Deserialize, Serialize};
    use tracing::error;

    use crate::models::{Health, ServerError, ServerResult, State};

    #[derive(Debug, Deserialize)]
    pub(crate) struct AllocateReq {
        owner: String,
        /// seconds
        ttl: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct ReleaseReq {
        address: Ipv4Addr,
        owner: String,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct RenewReq {
        address: Ipv4Addr,
        owner: String,
        /// seconds
        ttl: u64,
    }

    #[derive(Debug, Serialize)]
    pub(crate) struct LeaseResp {
        address: Ipv4Addr,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    }

    impl From<Lease> for LeaseResp {
        fn from(lease: Lease) -> Self {
            Self {
                address: lease.address(),
                expires_at: lease.expires_at(),
            }
        }
    }

    pub(crate) async fn allocate<S: LeaseStore>(
        Extension(alloc): Extension<Arc<Allocator<S>>>,
        Json(req): Json<AllocateReq>,
    ) -> ServerResult<Json<LeaseResp>> {
        let _timer = API_REQUEST_DURATION
            .with_label_values(&["allocate"])
            .start_timer();
        let lease = alloc
            .allocate(&req.owner, req.ttl.map(Duration::from_secs))
            .await
            .map_err(ServerError::from_ip)?;
        Ok(Json(lease.into()))
    }

    pub(crate) async fn release<S: LeaseStore>(
        Extension(alloc): Extension<Arc<Allocator<S>>>,
        Json(req): Json<ReleaseReq>,
    ) -> ServerResult<Json<LeaseResp>> {
        let _timer = API_REQUEST_DURATION
            .with_label_values(&["release"])
            .start_timer();
        let lease = alloc
            .release(req.address, &req.owner)
            .await
            .map_err(ServerError::from_ip)?;
        Ok(Json(lease.into()))
    }

    pub(crate) async fn renew<S: LeaseStore>(
        Extension(alloc): Extension<Arc<Allocator<S>>>,
        Json(req): Json<RenewReq>,
    ) -> ServerResult<Json<LeaseResp>> {
        let _timer = API_REQUEST_DURATION
            .with_label_values(&["renew"])
            .start_timer();
        let lease = alloc
            .renew(req.address, &req.owner, Duration::from_secs(req.ttl))
            .await
            .map_err(ServerError::from_ip)?;
        Ok(Json(lease.into()))
    }

    pub(crate) async fn leases<S: LeaseStore>(
        Extension(alloc): Extension<Arc<Allocator<S>>>,
    ) -> ServerResult<Json<Vec<Lease>>> {
        let _timer = API_REQUEST_DURATION
            .with_label_values(&["leases"])
            .start_timer();
        let leases = alloc.leases().await.map_err(ServerError::from_ip)?;
        Ok(Json(leases))
    }

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<IpamConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(Json(cfg.wire().clone()))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::{http::StatusCode, response::IntoResponse};
    use ip_manager::IpError;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};
    use tracing::{debug, error};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    // error type
    /// Wraps `anyhow::Error` with the status code to respond with
    #[derive(Debug)]
    pub struct ServerError {
        status: StatusCode,
        err: anyhow::Error,
    }
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl ServerError {
        /// error responding with `status`
        pub fn new(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
            Self {
                status,
                err: err.into(),
            }
        }

        /// the status code for each allocator outcome
        pub fn from_ip<E>(err: IpError<E>) -> Self
        where
            E: std::error::Error + Send + Sync + 'static,
        {
            let status = match &err {
                IpError::PoolExhausted { .. } => StatusCode::CONFLICT,
                IpError::NotFound(_) => StatusCode::NOT_FOUND,
                IpError::NotOwner { .. } => StatusCode::FORBIDDEN,
                IpError::OutOfRange(_) | IpError::EmptyOwner | IpError::InvalidTtl(_) => {
                    StatusCode::BAD_REQUEST
                }
                IpError::Timeout(_) | IpError::StoreUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            Self::new(status, err)
        }

        /// status code sent to the client
        pub fn status(&self) -> StatusCode {
            self.status
        }
    }

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            if self.status.is_server_error() {
                error!(err = ?self.err, status = %self.status, "request failed");
            } else {
                debug!(err = %self.err, status = %self.status, "request rejected");
            }
            (self.status, format!("{:#}", self.err)).into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}
