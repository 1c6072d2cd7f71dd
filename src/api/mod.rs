//! Management REST API
//!
//! The service layer owns the authorization rules; the handler only maps
//! routes and bodies onto it.

pub mod handler;
pub mod service;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, VigilError};

pub use service::Management;

/// Largest accepted request body
pub const DEFAULT_MAX_BODY: usize = 1024 * 1024;

const HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state behind every API connection
pub struct ApiState {
    pub management: Management,
    pub api_host: Option<Url>,
    pub max_body: usize,
}

/// HTTP/1 server for the management API
pub struct ApiServer {
    listener: TcpListener,
    addr: SocketAddr,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr, state: Arc<ApiState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| VigilError::ListenerError(format!("Failed to bind API to {}: {}", addr, e)))?;
        Self::from_listener(listener, state)
    }

    pub fn from_listener(listener: TcpListener, state: Arc<ApiState>) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves requests until the task is dropped
    pub async fn run(&self) -> Result<()> {
        info!("Management API listening on http://{}", self.addr);

        loop {
            let (stream, client_addr) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!("API accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    handler::handle_request(req, state)
                });

                let mut builder = http1::Builder::new();
                builder.timer(TokioTimer::new()).header_read_timeout(HEADER_TIMEOUT);
                if let Err(e) = builder.serve_connection(io, service).await {
                    debug!("API connection error from {}: {}", client_addr, e);
                }
            });
        }
    }
}
