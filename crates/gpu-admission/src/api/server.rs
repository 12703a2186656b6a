use std::sync::Arc;

use core::error::Error;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers::filter_predicates;
use super::handlers::healthz;
use super::handlers::prioritize_nodes;
use super::handlers::version;
use crate::scheduling::GpuFilter;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// HTTP server exposing the scheduler-extender routes.
pub struct ApiServer {
    filter: Arc<GpuFilter>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(filter: Arc<GpuFilter>, listen_addr: String) -> Self {
        Self {
            filter,
            listen_addr,
        }
    }

    /// Serve until failure or cancellation.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Server starting on {}", self.listen_addr);

        let app = Route::new()
            .at("/scheduler/predicates", post(filter_predicates))
            .at("/scheduler/priorities", post(prioritize_nodes))
            .at("/version", get(version))
            .data(self.filter)
            .with(Tracing);

        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Extender server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Extender server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("Extender server shutdown requested");
                Ok(())
            }
        }
    }
}

/// Secondary listener behind `--pprof-address`: build identity and liveness
/// only, bound separately so it can stay on a loopback address.
pub async fn run_debug_server(
    listen_addr: String,
    token: CancellationToken,
) -> Result<(), Report<ApiError>> {
    info!("Debug server starting on {listen_addr}");

    let app = Route::new()
        .at("/version", get(version))
        .at("/healthz", get(healthz));

    tokio::select! {
        result = Server::new(TcpListener::bind(&listen_addr)).run(app) => {
            result.map_err(|e| {
                Report::new(ApiError::ServerError {
                    message: format!("Debug server failed: {e}"),
                })
            })
        }
        _ = token.cancelled() => {
            info!("Debug server shutdown requested");
            Ok(())
        }
    }
}
