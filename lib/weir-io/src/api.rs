//! HTTP API server.
//!
//! Serves the Prometheus scrape endpoint at `/metrics` and a readiness probe
//! at `/ready`.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use tokio::{net::TcpListener, select, task::JoinHandle};
use tracing::{debug, error, info};
use weir_core::pipeline::ComponentShutdownHandle;
use weir_error::{ErrorContext as _, GenericError};

use crate::prometheus::PrometheusSink;

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared readiness flag.
///
/// Starts not ready; the process marks it ready once the pipeline is running.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Creates a flag in the not-ready state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the process as ready to serve.
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the process has been marked ready.
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A basic HTTP server exposing the scrape and readiness endpoints.
///
/// Each accepted connection is served on its own task. Shutdown stops the
/// accept loop; in-flight connections finish on their own.
pub struct ApiServer {
    listener: TcpListener,
    sink: Arc<PrometheusSink>,
    readiness: Readiness,
}

impl ApiServer {
    /// Binds the server to `listen_addr`.
    ///
    /// # Errors
    ///
    /// If the listen address cannot be bound, an error is returned.
    pub async fn bind(
        listen_addr: SocketAddr, sink: Arc<PrometheusSink>, readiness: Readiness,
    ) -> Result<Self, GenericError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_error_context(|| format!("failed to bind API server to {}", listen_addr))?;

        Ok(Self {
            listener,
            sink,
            readiness,
        })
    }

    /// Returns the bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, GenericError> {
        self.listener
            .local_addr()
            .error_context("failed to query API server local address")
    }

    /// Spawns the accept loop, serving connections until shutdown is
    /// signalled.
    pub fn listen(self, mut shutdown: ComponentShutdownHandle) -> JoinHandle<()> {
        let Self {
            listener,
            sink,
            readiness,
        } = self;

        let service = service_fn(move |request: Request<Incoming>| {
            let sink = Arc::clone(&sink);
            let readiness = readiness.clone();
            async move { Ok::<_, Infallible>(handle_request(&request, &sink, &readiness)) }
        });

        tokio::spawn(async move {
            info!("API server started.");

            let conn_builder = Builder::new(TokioExecutor::new());

            loop {
                select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            let service = service.clone();
                            let conn_builder = conn_builder.clone();

                            tokio::spawn(async move {
                                if let Err(e) = conn_builder.serve_connection(TokioIo::new(stream), service).await {
                                    error!(error = %e, "Failed to serve HTTP connection.");
                                }
                            });
                        },
                        Err(e) => {
                            error!(error = %e, "Failed to accept HTTP connection.");
                            break;
                        }
                    },

                    _ = &mut shutdown => {
                        debug!("Received shutdown signal.");
                        break;
                    }
                }
            }

            info!("API server stopped.");
        })
    }
}

fn handle_request(
    request: &Request<Incoming>, sink: &PrometheusSink, readiness: &Readiness,
) -> Response<Full<Bytes>> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => {
            text_response(StatusCode::OK, METRICS_CONTENT_TYPE, sink.render())
        }
        (&Method::GET, "/ready") => {
            if readiness.is_ready() {
                text_response(StatusCode::OK, "text/plain", "ready\n".to_string())
            } else {
                text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "starting\n".to_string(),
                )
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found\n".to_string()),
    }
}

fn text_response(
    status: StatusCode, content_type: &'static str, body: String,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
