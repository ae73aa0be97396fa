//! Co-hosted HTTP adapter.
//!
//! An axum router bound on `http_port` that maps REST routes onto
//! service methods. The correlation middleware reads `X-Correlation-ID`
//! from the request (minting one when absent), installs it for the
//! handler's duration and echoes it on the response. Error taxonomy
//! kinds map onto HTTP status codes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Json, Query, Request};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::Value;
use tracing::info;

use crate::correlation;
use crate::errors::ErrorKind;
use crate::service::{Service, ServiceError};

pub mod ws;

pub use ws::WsHub;

/// Correlation header read from requests and echoed on responses.
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// HTTP status for a taxonomy kind.
pub fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
        ErrorKind::AuthorizationError => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RpcTimeout => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct HttpError(ServiceError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = Json(serde_json::json!({
            "error": kind.as_str(),
            "message": self.0.to_string(),
            "correlation_id": correlation::current_or_mint(),
        }));
        (status_for_kind(kind), body).into_response()
    }
}

/// Middleware: read or mint the correlation ID, scope it around the
/// request, echo it back on the response.
async fn correlation_middleware(request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(String::from)
        .unwrap_or_else(correlation::mint);

    let mut response =
        correlation::with_correlation(correlation_id.clone(), next.run(request)).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

#[derive(Debug, Clone, Copy)]
enum RouteVerb {
    Get,
    Post,
    Put,
    Delete,
}

struct RouteSpec {
    verb: RouteVerb,
    path: String,
    method: String,
}

/// Maps REST routes onto a service's RPC methods.
///
/// Each route calls the method through the broker, so validation and the
/// rest of the dispatch pipeline apply to HTTP traffic too.
pub struct HttpAdapter {
    service: Arc<Service>,
    routes: Vec<RouteSpec>,
}

impl HttpAdapter {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            routes: Vec::new(),
        }
    }

    fn route(mut self, verb: RouteVerb, path: &str, method: &str) -> Self {
        self.routes.push(RouteSpec {
            verb,
            path: path.to_string(),
            method: method.to_string(),
        });
        self
    }

    /// GET route; query parameters become the payload object.
    pub fn get(self, path: &str, method: &str) -> Self {
        self.route(RouteVerb::Get, path, method)
    }

    /// POST route; the JSON body is the payload.
    pub fn post(self, path: &str, method: &str) -> Self {
        self.route(RouteVerb::Post, path, method)
    }

    /// PUT route; the JSON body is the payload.
    pub fn put(self, path: &str, method: &str) -> Self {
        self.route(RouteVerb::Put, path, method)
    }

    /// DELETE route; query parameters become the payload object.
    pub fn delete(self, path: &str, method: &str) -> Self {
        self.route(RouteVerb::Delete, path, method)
    }

    fn build_router(&self) -> Router {
        let mut router = Router::new();
        let service_name = self.service.name().to_string();

        for spec in &self.routes {
            let service = self.service.clone();
            let name = service_name.clone();
            let method = spec.method.clone();

            router = match spec.verb {
                RouteVerb::Post | RouteVerb::Put => {
                    let handler = move |Json(payload): Json<Value>| {
                        let service = service.clone();
                        let name = name.clone();
                        let method = method.clone();
                        async move {
                            service
                                .call_rpc(&name, &method, payload)
                                .await
                                .map(Json)
                                .map_err(HttpError)
                        }
                    };
                    match spec.verb {
                        RouteVerb::Put => router.route(&spec.path, put(handler)),
                        _ => router.route(&spec.path, post(handler)),
                    }
                }
                RouteVerb::Get | RouteVerb::Delete => {
                    let handler = move |Query(params): Query<HashMap<String, String>>| {
                        let service = service.clone();
                        let name = name.clone();
                        let method = method.clone();
                        async move {
                            let payload = Value::Object(
                                params
                                    .into_iter()
                                    .map(|(k, v)| (k, Value::String(v)))
                                    .collect(),
                            );
                            service
                                .call_rpc(&name, &method, payload)
                                .await
                                .map(Json)
                                .map_err(HttpError)
                        }
                    };
                    match spec.verb {
                        RouteVerb::Delete => router.route(&spec.path, delete(handler)),
                        _ => router.route(&spec.path, get(handler)),
                    }
                }
            };
        }

        router
            .layer(axum::middleware::from_fn(correlation_middleware))
            .layer(tower_http::trace::TraceLayer::new_for_http())
    }

    /// Bind `http_port` and serve until the task is cancelled.
    pub async fn serve(self) -> Result<(), ServiceError> {
        let port = self.service.config().http_port.ok_or_else(|| {
            ServiceError::Configuration("http_port is not configured".to_string())
        })?;
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| {
                ServiceError::Configuration(format!("failed to bind http port {}: {}", port, e))
            })?;
        info!(service = %self.service.name(), port, "HTTP adapter listening");

        axum::serve(listener, router)
            .await
            .map_err(|e| ServiceError::Configuration(format!("http server failed: {}", e)))
    }
}
