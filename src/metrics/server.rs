//! Exposition Server
//!
//! Minimal HTTP/1 server answering scrapes for one service registry.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Pause after a failed accept (EMFILE and friends) before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared by every connection of one exposition server.
#[derive(Clone)]
pub(crate) struct ExpositionState {
    pub(crate) service_name: String,
    pub(crate) registry: Registry,
    pub(crate) health: IntGauge,
    pub(crate) port: u16,
}

#[derive(Serialize)]
struct HealthBody<'a> {
    service: &'a str,
    status: &'a str,
    port: u16,
}

impl ExpositionState {
    fn respond(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/metrics" => match render(&self.registry) {
                Ok(text) => {
                    let mut response = Response::new(Full::new(Bytes::from(text)));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                    response
                }
                Err(e) => {
                    error!(service = %self.service_name, "Failed to encode metrics: {}", e);
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
                }
            },
            "/healthz" => {
                let healthy = self.health.get() == 1;
                let body = HealthBody {
                    service: &self.service_name,
                    status: if healthy { "healthy" } else { "unhealthy" },
                    port: self.port,
                };
                let mut response =
                    Response::new(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                if !healthy {
                    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                }
                response
            }
            _ => plain(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Render a registry in the Prometheus text exposition format.
pub(crate) fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("non UTF-8 exposition: {}", e)))
}

/// Handle to a running exposition server. Dropping it stops the server.
pub(crate) struct ServerHandle {
    port: u16,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve an already-bound listener on the current tokio runtime.
pub(crate) fn spawn(listener: StdTcpListener, mut state: ExpositionState) -> Result<ServerHandle> {
    let handle = Handle::try_current().map_err(|e| {
        Error::Internal(format!("metrics server requires a tokio runtime: {}", e))
    })?;

    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();
    state.port = port;

    let listener = {
        let _guard = handle.enter();
        TcpListener::from_std(listener)?
    };

    let shutdown = CancellationToken::new();
    handle.spawn(serve(listener, state, shutdown.clone()));

    Ok(ServerHandle { port, shutdown })
}

async fn serve(listener: TcpListener, state: ExpositionState, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(service = %state.service_name, port = state.port, "Metrics server stopped");
                return;
            }
            accepted = accept_or_backoff(listener.accept(), &state.service_name) => match accepted {
                Some((stream, _)) => stream,
                None => continue,
            },
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = state.respond(&req);
                async move { Ok::<_, Infallible>(response) }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            // Keep-alive connections outlive the accept loop unless told to close
            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                debug!("Metrics server connection error: {}", e);
            }
        });
    }
}

/// Await one accept. A failure is logged and followed by
/// [`ACCEPT_RETRY_DELAY`] before `None` is returned.
async fn accept_or_backoff<T>(
    accept: impl Future<Output = io::Result<T>>,
    service_name: &str,
) -> Option<T> {
    match accept.await {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            warn!(service = %service_name, "Metrics server accept error: {}", e);
            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            None
        }
    }
}
