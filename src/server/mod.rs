//! wsgate server implementation

pub mod connection;
pub mod gateway;
pub mod rotation;

use crate::config::ServerConfig;
use crate::logger::{EventLogger, FileSink};
use crate::types::LogFields;
use crate::{GatewayError, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Form, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use connection::{CloseReason, Connection, ConnectionId, ConnectionState};
pub use gateway::ConnectionGateway;
pub use rotation::{rotation_channel, RotationController, RotationHandle, RotationRequests};

/// Shared state handed to the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Connection gateway behind the upgrade endpoint
    pub gateway: Arc<ConnectionGateway>,
    /// Process event logger
    pub logger: Arc<EventLogger>,
}

#[derive(Debug, Deserialize)]
struct MessageForm {
    #[serde(default)]
    msg: String,
}

/// Main wsgate server that coordinates all components
pub struct GatewayServer {
    config: ServerConfig,
    logger: Arc<EventLogger>,
    gateway: Arc<ConnectionGateway>,
    rotation: Option<Arc<RotationController>>,
    rotation_handle: RotationHandle,
    rotation_requests: Mutex<Option<RotationRequests>>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Validate `config` and open the configured sinks
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (logger, file_sink) = EventLogger::from_settings(&config.logging)?;
        Ok(Self::with_logger(config, Arc::new(logger), file_sink))
    }

    /// Build around an existing logger. `file_sink`, when given, is the sink
    /// rotation requests act on.
    pub fn with_logger(
        config: ServerConfig,
        logger: Arc<EventLogger>,
        file_sink: Option<Arc<FileSink>>,
    ) -> Self {
        let gateway = Arc::new(ConnectionGateway::from_settings(&config.gateway));
        install_default_handlers(&gateway, &logger);

        let rotation = file_sink
            .map(|sink| Arc::new(RotationController::new(sink, Arc::clone(&logger))));
        let (rotation_handle, requests) = rotation_channel();
        // Without a rotatable sink the queue is closed and requests report `false`.
        let rotation_requests = rotation.as_ref().map(|_| requests);

        Self {
            config,
            logger,
            gateway,
            rotation,
            rotation_handle,
            rotation_requests: Mutex::new(rotation_requests),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the HTTP router: upgrade endpoint, message route, access log and CORS
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            logger: Arc::clone(&self.logger),
        };

        Router::new()
            .route(&self.config.gateway.endpoint, get(ws_handler))
            .route(&self.config.server.message_route, post(message_handler))
            .layer(middleware::from_fn_with_state(state.clone(), access_log))
            .layer(CorsLayer::very_permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self) -> Result<()> {
        let addr = self.config.bind_address()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Server(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`GatewayServer::shutdown`]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let mut background = self.start_rotation()?;

        let gateway = Arc::clone(&self.gateway);
        let token = self.shutdown.clone();
        let drain_timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        let drain = tokio::spawn(async move {
            token.cancelled().await;
            gateway.shutdown(drain_timeout).await
        });

        info!(address = %local_addr, endpoint = %self.config.gateway.endpoint, "gateway listening");
        self.logger.info_with_fields(
            "gateway started",
            LogFields::new()
                .with("address", local_addr.to_string())
                .with("endpoint", self.config.gateway.endpoint.as_str()),
        );

        let served = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
        .await;

        // A listener error stops the server just like a shutdown request.
        self.shutdown.cancel();
        match drain.await {
            Ok(true) => {}
            Ok(false) => self.logger.warn_with_fields(
                "connections still open after shutdown timeout",
                LogFields::new().with("open", self.gateway.connection_count()),
            ),
            Err(e) => error!(error = %e, "drain task failed"),
        }
        for task in background.drain(..) {
            let _ = task.await;
        }

        self.logger.info("gateway stopped");
        self.logger.flush();

        served.map_err(|e| GatewayError::Server(format!("Listener failed: {}", e)))
    }

    fn start_rotation(&self) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut tasks = Vec::new();
        let (Some(controller), Some(requests)) = (&self.rotation, self.rotation_requests.lock().take())
        else {
            return Ok(tasks);
        };

        tasks.push(controller.spawn(requests, self.shutdown.clone()));

        #[cfg(unix)]
        if self.config.logging.file.rotation.on_signal {
            tasks.push(rotation::forward_hangup(
                self.rotation_handle.clone(),
                self.shutdown.clone(),
            )?);
        }
        Ok(tasks)
    }

    /// Ask a running server to stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled when the server stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger for log rotation, usable instead of SIGHUP
    pub fn rotation_handle(&self) -> RotationHandle {
        self.rotation_handle.clone()
    }

    /// Rotation controller, present when a file sink is configured
    pub fn rotation(&self) -> Option<&Arc<RotationController>> {
        self.rotation.as_ref()
    }

    /// Process event logger
    pub fn logger(&self) -> &Arc<EventLogger> {
        &self.logger
    }

    /// Connection gateway
    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    /// Active configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Log connection lifecycle and every inbound message through `logger`
pub fn install_default_handlers(gateway: &ConnectionGateway, logger: &Arc<EventLogger>) {
    let logger = Arc::clone(logger);
    gateway.on_connect(move |conn| {
        logger.info_with_fields(
            "connection opened",
            LogFields::new()
                .with("connection", conn.id().to_string())
                .with("remote", conn.remote_addr().to_string()),
        );

        let on_message = Arc::clone(&logger);
        conn.on_message(move |conn, data| {
            on_message.info_with_fields(
                String::from_utf8_lossy(&data),
                LogFields::new().with("connection", conn.id().to_string()),
            );
        });

        let on_close = Arc::clone(&logger);
        conn.on_disconnect(move |conn, reason| {
            on_close.info_with_fields(
                "connection closed",
                LogFields::new()
                    .with("connection", conn.id().to_string())
                    .with("reason", reason.to_string())
                    .with("policy_violation", reason.is_policy_violation()),
            );
        });
    });
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let gateway = state.gateway;
    let limit = gateway.settings().max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move { gateway.serve(socket, remote).await })
}

async fn message_handler(State(state): State<AppState>, Form(form): Form<MessageForm>) -> StatusCode {
    state.logger.info(form.msg);
    StatusCode::OK
}

async fn access_log(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let response = next.run(request).await;

    state.logger.info_with_fields(
        "http request",
        LogFields::new()
            .with("status", response.status().as_u16() as u32)
            .with("ip", ip)
            .with("method", method)
            .with("path", path)
            .with("latency", started.elapsed()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use axum::body::Body;
    use axum::http::{self, header, Method};
    use tower::ServiceExt;

    fn test_server() -> (GatewayServer, Arc<MemorySink>) {
        let capture = Arc::new(MemorySink::new("capture"));
        let logger = Arc::new(EventLogger::builder().sink(capture.clone()).build());
        (GatewayServer::with_logger(ServerConfig::default(), logger, None), capture)
    }

    #[tokio::test]
    async fn post_message_is_logged() {
        let (server, capture) = test_server();
        let response = server
            .router()
            .oneshot(
                http::Request::builder()
                    .method(Method::POST)
                    .uri("/msg")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("msg=hello+world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records = capture.records().unwrap();
        assert_eq!(records[0].message, "hello world");
        let access = &records[1];
        assert_eq!(access.message, "http request");
        assert_eq!(access.fields.get("path"), Some(&"/msg".into()));
        assert_eq!(access.fields.get("method"), Some(&"POST".into()));
    }

    #[tokio::test]
    async fn unknown_route_is_still_access_logged() {
        let (server, capture) = test_server();
        let response = server
            .router()
            .oneshot(http::Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let records = capture.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].fields.get("status").and_then(crate::types::FieldValue::as_u64),
            Some(404)
        );
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let (server, _) = test_server();
        let response = server
            .router()
            .oneshot(
                http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/msg")
                    .header(header::ORIGIN, "http://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://example.com"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }

    #[test]
    fn rotation_handle_reports_closed_queue_without_file_sink() {
        let (server, _) = test_server();
        assert!(server.rotation().is_none());
        assert!(!server.rotation_handle().request());
    }
}
