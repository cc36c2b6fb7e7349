//! HTTP front door: an axum router serving `POST /login` and upgrading
//! channel paths to WebSocket sessions.
//!
//! hyper drives the router directly on the sniffed stream, so plaintext
//! and TLS connections share one code path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blockwire_protocol::Channel;
use blockwire_protocol::constants::{LOGIN_PATH, WS_MAX_MESSAGE_SIZE};
use blockwire_protocol::{LoginError, LoginRequest, LoginResponse};

use crate::ServerError;
use crate::connection::{Connection, ConnectionOptions};
use crate::detect::Transport;
use crate::server::ServerState;
use crate::session::run_session;

const MAX_LOGIN_BODY: usize = 4 * 1024;

/// Everything a request on one accepted connection needs.
#[derive(Clone)]
pub(crate) struct FrontDoor {
    pub(crate) state: Arc<ServerState>,
    pub(crate) options: ConnectionOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) peer: SocketAddr,
    pub(crate) transport: Transport,
}

pub(crate) fn router(door: FrontDoor) -> Router {
    Router::new()
        .route(LOGIN_PATH, post(login))
        .fallback(open_channel)
        .layer(DefaultBodyLimit::max(MAX_LOGIN_BODY))
        .with_state(door)
}

/// Serves HTTP/1.1 on `stream` until the response is written or the
/// connection is handed over to a channel session.
pub(crate) async fn serve_http<S>(
    stream: S,
    door: FrontDoor,
    header_timeout: Duration,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router(door));
    hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;
    Ok(())
}

async fn login(State(door): State<FrontDoor>, body: Bytes) -> Response {
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(peer = %door.peer, "malformed login body: {e}");
            return (StatusCode::BAD_REQUEST, Json(error_body("malformed login request")))
                .into_response();
        }
    };

    match door.state.auth.login(&request.username, &request.password).await {
        Some(token) => {
            info!(peer = %door.peer, user = %request.username, "login succeeded");
            Json(LoginResponse { token }).into_response()
        }
        None => {
            warn!(peer = %door.peer, user = %request.username, "login failed");
            (StatusCode::UNAUTHORIZED, Json(error_body("invalid credentials"))).into_response()
        }
    }
}

fn error_body(msg: &str) -> LoginError {
    LoginError {
        error: msg.to_string(),
    }
}

fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Frame size limits for every channel.
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

/// Answers a channel upgrade with `101` and runs the session on the
/// upgraded stream once hyper releases it.
async fn open_channel(State(door): State<FrontDoor>, mut req: Request<Body>) -> Response {
    let Some(channel) = Channel::from_path(req.uri().path()) else {
        debug!(peer = %door.peer, path = %req.uri(), "unknown path");
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    if !is_websocket_upgrade(req.method(), req.headers()) {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _) = req.into_parts();
    let switching = match create_response(&Request::from_parts(parts, ())) {
        Ok(response) => response,
        Err(e) => {
            debug!(peer = %door.peer, %channel, "rejected upgrade: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(peer = %door.peer, %channel, "upgrade failed: {e}");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            Role::Server,
            Some(ws_config()),
        )
        .await;
        info!(peer = %door.peer, %channel, transport = %door.transport, "channel opened");

        let conn = Connection::spawn(ws, door.peer, door.options, &door.cancel);
        run_session(conn, channel, door.state).await;
        info!(peer = %door.peer, %channel, "channel closed");
    });

    let (parts, ()) = switching.into_parts();
    Response::from_parts(parts, Body::empty())
}
