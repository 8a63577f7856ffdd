//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo; one task per connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudMetadata;
use crate::config::Args;
use crate::routes;
use crate::services::{ClientFactory, JoinService};
use crate::types::{JoinError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Join API business logic
    pub join: JoinService,
}

impl AppState {
    pub fn new(
        args: Args,
        cloud: Arc<dyn CloudMetadata>,
        clients: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let allowed = args.allowed_classes().map_err(JoinError::Config)?;
        let join = JoinService::new(cloud, clients, allowed, args.directory.naming());
        Ok(Self { args, join })
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!("realm-join listening on {}", state.args.listen);
    if !crate::ipa::ticket::client_configured(&state.args.directory.ipa_conf) {
        warn!(
            "{} not found, join requests will not enroll hosts",
            state.args.directory.ipa_conf.display()
        );
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let response = route(state, &method, &path, req.into_body()).await;
    info!("[{}] {} {} -> {}", addr, method, path, response.status().as_u16());
    Ok(response)
}

/// Dispatch a request to its handler
pub async fn route<B>(state: Arc<AppState>, method: &Method, path: &str, body: B) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match (method, path) {
        (&Method::POST, "/" | "/v1" | "/v1/") => routes::handle_join(state, body).await,
        (_, "/" | "/v1" | "/v1/") => routes::fault(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),

        (&Method::GET, "/health" | "/healthz") => routes::health_check(state),
        (&Method::GET, "/version") => routes::version_info(),

        _ => routes::fault(StatusCode::NOT_FOUND, &format!("No route for {}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, FakeClientFactory, FakeCloud, FakeTransport};
    use clap::Parser;

    fn state(args: &[&str]) -> Arc<AppState> {
        Arc::new(
            AppState::new(
                Args::parse_from(args),
                Arc::new(FakeCloud::new()),
                Arc::new(FakeClientFactory::unconfigured(&FakeTransport::new())),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_join_paths() {
        let state = state(&["realm-join"]);
        for path in ["/", "/v1", "/v1/"] {
            let body = Full::new(Bytes::from(
                r#"{"instance-id":"i1","image-id":"img1","project-id":"p1","hostname":"test"}"#,
            ));
            let response = route(state.clone(), &Method::POST, path, body).await;
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_wrong_method_on_join() {
        let response = route(state(&["realm-join"]), &Method::GET, "/", Full::new(Bytes::new())).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(body_json(response).await.get("badMethod").is_some());
    }

    #[tokio::test]
    async fn test_health_and_unknown_routes() {
        let state = state(&["realm-join"]);

        let response = route(state.clone(), &Method::GET, "/healthz", Full::new(Bytes::new())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = route(state.clone(), &Method::GET, "/version", Full::new(Bytes::new())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = route(state, &Method::GET, "/nope", Full::new(Bytes::new())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"itemNotFound": {"code": 404, "message": "No route for /nope"}})
        );
    }

    #[test]
    fn test_bad_allowed_classes_rejected() {
        let result = AppState::new(
            Args::parse_from(["realm-join", "--allowed-classes", "broken"]),
            Arc::new(FakeCloud::new()),
            Arc::new(FakeClientFactory::unconfigured(&FakeTransport::new())),
        );
        assert!(matches!(result, Err(JoinError::Config(_))));
    }
}
