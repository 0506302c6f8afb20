//! WebSocket attach listener using tokio-tungstenite.
//!
//! Each accepted TCP connection is upgraded only if the bridge would accept
//! it; refusals are answered during the handshake with a plain HTTP status.
//! The authoritative check happens again in [`ConnectionBridge::attach`].

use crate::bridge::ConnectionBridge;
use lablink_core::{bearer_from_query, header_candidates, AttachError, LabError, LabResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tracing::{debug, error, info, warn};

/// Path clients upgrade on.
pub const ATTACH_PATH: &str = "/ws";

/// Bind the listener and start accepting. Returns the bound address and the
/// accept loop task.
pub async fn start_listener(
    bind_addr: SocketAddr,
    bridge: Arc<ConnectionBridge>,
) -> LabResult<(SocketAddr, JoinHandle<()>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| LabError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, bridge).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, task))
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, bridge: Arc<ConnectionBridge>) {
    let mut token = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let accepted = authorize_upgrade(req, &bridge)?;
        token = Some(accepted);
        Ok(resp)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!(remote = %addr, error = %e, "WebSocket handshake refused or failed");
            return;
        }
    };
    let Some(token) = token else {
        return;
    };

    debug!(remote = %addr, "WebSocket connection accepted");
    match bridge.attach(ws_stream, &token).await {
        Ok(handle) => {
            info!(remote = %addr, relay_id = handle.id(), "relay started");
            handle.closed().await;
            debug!(remote = %addr, relay_id = handle.id(), "relay finished");
        }
        Err(e) => {
            warn!(
                remote = %addr,
                error = %e,
                phase = ?bridge.phase(),
                "attach lost a race after upgrade"
            );
        }
    }
}

/// Decide whether an upgrade request may proceed; returns the bearer token.
///
/// The token comes from `?token=` or the `Authorization` header.
pub fn authorize_upgrade(
    req: &Request,
    bridge: &ConnectionBridge,
) -> Result<String, ErrorResponse> {
    if req.uri().path() != ATTACH_PATH {
        return Err(refusal(StatusCode::NOT_FOUND, "Not found"));
    }

    let candidates: Vec<String> = match req.uri().query().and_then(bearer_from_query) {
        Some(token) => vec![token],
        None => req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|value| header_candidates(value).map(str::to_string).collect())
            .unwrap_or_default(),
    };

    let mut refused = AttachError::Unauthorized;
    for token in candidates {
        match bridge.precheck(&token) {
            Ok(()) => return Ok(token),
            Err(e) => refused = e,
        }
    }
    let status =
        StatusCode::from_u16(refused.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Err(refusal(status, &refused.to_string()))
}

fn refusal(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}
