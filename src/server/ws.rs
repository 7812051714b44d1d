use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frames::{ClientFrame, ServerFrame};
use super::query::{BridgeRequest, WsRequest, parse_request};
use crate::config::BridgeConfig;
use crate::error::SessionError;
use crate::log_stream::PacketLog;
use crate::session::{Session, SessionEvent, SessionManager};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a socket handler needs from the process.
#[derive(Clone)]
pub struct ServerContext {
    pub manager: Arc<SessionManager>,
    pub packet_log: Arc<PacketLog>,
    pub config: Arc<BridgeConfig>,
    pub shutdown: CancellationToken,
}

/// Accept loop: one task per socket, never blocked by a slow client.
pub async fn run_server(listener: TcpListener, context: ServerContext) {
    let addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!(%addr, "bridge listening");

    loop {
        tokio::select! {
            () = context.shutdown.cancelled() => {
                info!("shutdown requested; stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let context = context.clone();
                        tokio::spawn(async move {
                            handle_socket(stream, peer, context).await;
                        });
                    }
                    Err(error) => {
                        // Transient accept errors should not kill the bridge.
                        warn!(%error, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, context: ServerContext) {
    let mut request_query: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        request_query = request.uri().query().map(str::to_string);
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(error) => {
            debug!(%peer, %error, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, stream) = ws.split();

    let request = match parse_request(request_query.as_deref(), &context.config) {
        Ok(request) => request,
        Err(error) => {
            send_frame(
                &mut sink,
                &ServerFrame::Error {
                    error: error.to_string(),
                },
            )
            .await;
            close_with_reason(&mut sink, &error.to_string()).await;
            return;
        }
    };

    match request {
        WsRequest::LogStream { filter } => {
            run_log_stream(sink, stream, peer, context, filter).await;
        }
        WsRequest::Bridge(bridge) => {
            run_bridge_socket(sink, stream, peer, context, bridge).await;
        }
    }
}

/// One bridge client: resolve the session, attach, pump both directions.
async fn run_bridge_socket(
    mut sink: WsSink,
    mut stream: WsStream,
    peer: SocketAddr,
    context: ServerContext,
    request: BridgeRequest,
) {
    let socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);

    let session = match context
        .manager
        .get_or_create(request.session_id.clone(), request.config)
    {
        Ok(session) => session,
        Err(error) => {
            send_frame(&mut sink, &ServerFrame::Error { error: error.to_string() }).await;
            close_with_reason(&mut sink, &error.to_string()).await;
            return;
        }
    };
    let session_id = session.session_id().to_string();

    let client = match session.attach(socket_id).await {
        Ok(client) => client,
        Err(error) => {
            debug!(%peer, session = %session_id, %error, "attach failed");
            send_frame(&mut sink, &ServerFrame::Error { error: error.to_string() }).await;
            close_with_reason(&mut sink, &error.to_string()).await;
            context.manager.discard_if_unattached(&session_id);
            return;
        }
    };
    let mut events = client.events;

    send_frame(
        &mut sink,
        &ServerFrame::Connected {
            device: client.device_name,
            token: client.token,
            session: client.session_id,
        },
    )
    .await;
    info!(%peer, session = %session_id, socket_id, "client attached");

    let mut force_cleaned = false;
    loop {
        tokio::select! {
            maybe_message = stream.next() => {
                let Some(Ok(message)) = maybe_message else {
                    debug!(%peer, "socket closed by client");
                    break;
                };
                match message {
                    Message::Text(text) => {
                        if handle_client_frame(&mut sink, &session, text.as_str()).await {
                            force_cleaned = true;
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        send_frame(&mut sink, &ServerFrame::Error {
                            error: "binary frames are not supported".to_string(),
                        }).await;
                    }
                    Message::Close(_) => break,
                    // Protocol-level ping/pong is answered by the library.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Data(bytes)) => {
                        send_frame(&mut sink, &ServerFrame::Data { data: bytes }).await;
                    }
                    Ok(SessionEvent::Disconnected) => {
                        send_frame(&mut sink, &ServerFrame::Disconnected).await;
                    }
                    Ok(SessionEvent::Closed { reason }) => {
                        close_with_reason(&mut sink, &reason).await;
                        force_cleaned = true;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%peer, missed, "socket fell behind the session fan-out");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if !force_cleaned {
        session.detach(socket_id);
    }
    debug!(%peer, socket_id, "socket handler finished");
}

/// Handles one inbound text frame. Returns true when the socket must close.
async fn handle_client_frame(sink: &mut WsSink, session: &Arc<Session>, text: &str) -> bool {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(error) => {
            send_frame(sink, &ServerFrame::Error {
                error: format!("malformed frame: {error}"),
            })
            .await;
            return false;
        }
    };

    match frame {
        ClientFrame::Data { data } => {
            if let Err(error) = session.write(&data).await {
                // Write-path failures are surfaced, not fatal: the client
                // decides whether to retry or walk away.
                send_frame(sink, &ServerFrame::Error { error: error.to_string() }).await;
            }
            false
        }
        ClientFrame::ForceCleanup { token } => {
            if !session.token_matches(&token) {
                send_frame(sink, &ServerFrame::Error {
                    error: SessionError::InvalidToken.to_string(),
                })
                .await;
                return false;
            }
            session.force_cleanup("client request").await;
            send_frame(sink, &ServerFrame::ForceCleanupComplete {
                message: "Cleanup complete".to_string(),
            })
            .await;
            close_with_reason(sink, "cleanup complete").await;
            true
        }
    }
}

/// Observability stream: backlog from the ring, then live entries, with an
/// optional hex-substring filter.
async fn run_log_stream(
    mut sink: WsSink,
    mut stream: WsStream,
    peer: SocketAddr,
    context: ServerContext,
    filter: Option<String>,
) {
    info!(%peer, ?filter, "log-stream subscriber attached");
    let mut live = context.packet_log.subscribe();
    let mut watermark = 0u64;

    for entry in context.packet_log.entries_after(watermark) {
        watermark = entry.seq;
        if entry.matches_filter(filter.as_deref()) {
            send_json(&mut sink, &entry).await;
        }
    }

    loop {
        tokio::select! {
            () = context.shutdown.cancelled() => {
                close_with_reason(&mut sink, "shutdown").await;
                break;
            }
            maybe_message = stream.next() => {
                match maybe_message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            received = live.recv() => {
                match received {
                    Ok(entry) => {
                        if entry.seq > watermark && entry.matches_filter(filter.as_deref()) {
                            watermark = entry.seq;
                            send_json(&mut sink, &entry).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%peer, missed, "log-stream subscriber fell behind");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!(%peer, "log-stream subscriber finished");
}

async fn send_frame(sink: &mut WsSink, frame: &ServerFrame) {
    if let Err(error) = sink.send(Message::Text(frame.to_json().into())).await {
        debug!(%error, "failed to send frame");
    }
}

async fn send_json<T: serde::Serialize>(sink: &mut WsSink, value: &T) {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(error) => {
            warn!(%error, "failed to serialize log entry");
            return;
        }
    };
    if let Err(error) = sink.send(Message::Text(json.into())).await {
        debug!(%error, "failed to send log entry");
    }
}

async fn close_with_reason(sink: &mut WsSink, reason: &str) {
    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    }));
    if let Err(error) = sink.send(close).await {
        debug!(%error, "failed to send close frame");
    }
}
