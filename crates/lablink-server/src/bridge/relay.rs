//! The two relay directions for one attached client.
//!
//! Both directions run inside one task and share a cancellation token; each
//! one cancels the token when it exits, which stops its sibling.

use super::ConnectionBridge;
use crate::hardware::HardwareChannel;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use lablink_core::{ClientMessage, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound for sending the disconnect notice and the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Log an idle line once per this many empty hardware polls.
const IDLE_LOG_EVERY: u32 = 50;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed the socket.
    ClientClosed,
    /// Reading from or writing to the socket failed.
    TransportError,
    /// Reading from or writing to the hardware channel failed.
    HardwareError,
    /// Stopped by the bridge (detach or forced disconnect).
    Cancelled,
}

/// Per-relay tuning copied from the bridge config.
#[derive(Debug, Clone, Copy)]
pub(super) struct RelayTuning {
    pub poll_interval: Duration,
    pub read_buffer: usize,
    pub max_frame_size: usize,
}

/// Handles owned by the bridge for a running relay.
pub(super) struct RelayControl {
    pub id: u64,
    pub cancel: CancellationToken,
    pub notify_disconnect: Arc<AtomicBool>,
    pub finished: CancellationToken,
}

/// Run a relay to completion, then report back to the bridge.
pub(super) async fn run<S>(
    bridge: Arc<ConnectionBridge>,
    ws: WebSocketStream<S>,
    id: u64,
    cancel: CancellationToken,
    notify_disconnect: Arc<AtomicBool>,
    finished: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _finished = finished.drop_guard();
    let tuning = bridge.tuning();

    // A previous relay may still be draining; the channel is never shared.
    let owner = tokio::select! {
        _ = cancel.cancelled() => None,
        guard = bridge.channel_owner.clone().lock_owned() => Some(guard),
    };

    let (mut sink, mut stream) = ws.split();
    let end = match owner {
        Some(owner) => {
            let channel = bridge.channel.as_ref();
            let (inbound_end, outbound_end) = tokio::join!(
                inbound(&mut stream, channel, &cancel, tuning, id),
                outbound(&mut sink, channel, &cancel, tuning, id),
            );
            drop(owner);
            if inbound_end != RelayEnd::Cancelled {
                inbound_end
            } else {
                outbound_end
            }
        }
        None => RelayEnd::Cancelled,
    };

    if notify_disconnect.load(Ordering::SeqCst) {
        send_notice(&mut sink, id).await;
    }
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(relay_id = id, error = %e, "socket close failed"),
        Err(_) => debug!(relay_id = id, "socket close timed out"),
    }

    info!(relay_id = id, ?end, "relay stopped");
    bridge.detach(id, end);
}

/// Client → hardware.
async fn inbound<St>(
    stream: &mut St,
    channel: &dyn HardwareChannel,
    cancel: &CancellationToken,
    tuning: RelayTuning,
    id: u64,
) -> RelayEnd
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let _sibling = cancel.clone().drop_guard();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return RelayEnd::Cancelled,
            next = stream.next() => next,
        };

        let payload = match next {
            None | Some(Ok(Message::Close(_))) => {
                debug!(relay_id = id, "client closed the connection");
                return RelayEnd::ClientClosed;
            }
            Some(Err(e)) => {
                warn!(relay_id = id, error = %e, "socket read failed");
                return RelayEnd::TransportError;
            }
            Some(Ok(Message::Text(text))) => {
                if text.len() > tuning.max_frame_size {
                    warn!(relay_id = id, len = text.len(), "dropping oversized client frame");
                    continue;
                }
                match ClientMessage::parse(text.as_str()) {
                    Ok(msg) => msg.into_payload(),
                    Err(e) => {
                        warn!(relay_id = id, error = %e, "dropping malformed client frame");
                        continue;
                    }
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > tuning.max_frame_size {
                    warn!(relay_id = id, len = data.len(), "dropping oversized client frame");
                    continue;
                }
                data.to_vec()
            }
            // ping/pong are answered by tungstenite
            Some(Ok(_)) => continue,
        };

        if payload.is_empty() {
            continue;
        }
        trace!(relay_id = id, bytes = payload.len(), "client -> hardware");
        if let Err(e) = channel.write(&payload).await {
            warn!(relay_id = id, error = %e, "hardware write failed");
            return RelayEnd::HardwareError;
        }
    }
}

/// Hardware → client.
async fn outbound<Si>(
    sink: &mut Si,
    channel: &dyn HardwareChannel,
    cancel: &CancellationToken,
    tuning: RelayTuning,
    id: u64,
) -> RelayEnd
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let _sibling = cancel.clone().drop_guard();
    let mut buf = vec![0u8; tuning.read_buffer.max(1)];
    let mut idle_polls: u32 = 0;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return RelayEnd::Cancelled,
            read = channel.read(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!(relay_id = id, error = %e, "hardware read failed");
                return RelayEnd::HardwareError;
            }
        };

        if n == 0 {
            idle_polls = idle_polls.wrapping_add(1);
            if idle_polls % IDLE_LOG_EVERY == 0 {
                debug!(relay_id = id, "no data from hardware");
            }
            tokio::select! {
                _ = cancel.cancelled() => return RelayEnd::Cancelled,
                _ = tokio::time::sleep(tuning.poll_interval) => {}
            }
            continue;
        }

        let json = match ServerMessage::uart(&buf[..n]).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(relay_id = id, error = %e, "cannot encode hardware chunk");
                continue;
            }
        };
        trace!(relay_id = id, bytes = n, "hardware -> client");
        let sent = tokio::select! {
            _ = cancel.cancelled() => return RelayEnd::Cancelled,
            sent = sink.send(Message::Text(json.into())) => sent,
        };
        if let Err(e) = sent {
            warn!(relay_id = id, error = %e, "socket write failed");
            return RelayEnd::TransportError;
        }
    }
}

/// Best-effort `{"type":"disconnect"}` before a forced close.
async fn send_notice<Si>(sink: &mut Si, id: u64)
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = match ServerMessage::Disconnect.to_json() {
        Ok(json) => json,
        Err(_) => return,
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => debug!(relay_id = id, "sent disconnect notice"),
        Ok(Err(e)) => debug!(relay_id = id, error = %e, "disconnect notice not delivered"),
        Err(_) => debug!(relay_id = id, "disconnect notice timed out"),
    }
}
