//! Per-connection protocol handling.
//!
//! Connections are auth-first: the only frame accepted before a
//! successful `auth` is `auth`. After the handshake, frames demux to the
//! session machine, delivery tracker, and router. Unknown frame types are
//! rejected and logged without dropping the connection; malformed frames
//! close it.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_core::NodeId;
use meridian_hooks::RuntimeEvent;
use meridian_proto::{
    Frame, SessionEvent,
    frame::{AuthPayload, AuthResultPayload, RegisterPayload},
};

use crate::buffer::PriorityBuffer;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::RegisteredNode;
use crate::router::Dispatcher;
use crate::server::{ServerInner, SocketStream};

type WsWriter = SplitSink<WebSocketStream<Box<dyn SocketStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<Box<dyn SocketStream>>>;

/// Dispatcher delivering into a node's priority buffer and waking its
/// pump task.
struct NodeDispatcher {
    buffer: Arc<Mutex<PriorityBuffer>>,
    notify: Arc<Notify>,
}

#[async_trait::async_trait]
impl Dispatcher for NodeDispatcher {
    async fn dispatch(&self, message: meridian_proto::LaneMessage) -> GatewayResult<()> {
        {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| GatewayError::Transport("buffer lock poisoned".to_string()))?;
            buffer.dispatch(message)?;
        }
        self.notify.notify_one();
        Ok(())
    }
}

/// Drains a node's buffer to its socket in priority order, stamping
/// delivery ids as messages go out.
async fn pump_loop(
    node_id: NodeId,
    buffer: Arc<Mutex<PriorityBuffer>>,
    notify: Arc<Notify>,
    out_tx: mpsc::UnboundedSender<Frame>,
    inner: Arc<ServerInner>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = notify.notified() => {},
        }
        loop {
            let batch = buffer.lock().map(|mut b| b.drain()).unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            for message in batch {
                let (_, payload) = inner.delivery.track(&node_id, message);
                if out_tx.send(Frame::Message(payload)).is_err() {
                    return;
                }
            }
        }
    }
}

/// Serve one accepted socket to completion.
pub(crate) async fn serve_connection(inner: Arc<ServerInner>, stream: Box<dyn SocketStream>) {
    let connection_id = Uuid::new_v4();
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "websocket handshake failed");
            return;
        },
    };
    let (mut writer, mut reader) = ws.split();

    let Some(node_id) = authenticate(&inner, &mut writer, &mut reader).await else {
        let _ = writer.close().await;
        return;
    };
    info!(connection_id = %connection_id, node_id = %node_id, "node authenticated");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut state = ConnectionState {
        inner: Arc::clone(&inner),
        connection_id,
        node_id: node_id.clone(),
        out_tx: out_tx.clone(),
        registered: false,
        pump: None,
    };

    while let Some(incoming) = reader.next().await {
        match incoming {
            Ok(Message::Text(text)) => match Frame::decode(text.as_ref()) {
                Ok(frame) => {
                    if state.handle_frame(frame).await.is_break() {
                        break;
                    }
                },
                Err(e) if e.is_fatal() => {
                    warn!(node_id = %node_id, error = %e, "malformed frame, closing connection");
                    break;
                },
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "rejecting frame");
                },
            },
            Ok(Message::Close(_)) => {
                debug!(node_id = %node_id, "close frame received");
                break;
            },
            Ok(_) => {
                // Transport-level ping/pong and binary frames are handled
                // (or ignored) below the protocol.
            },
            Err(e) => {
                debug!(node_id = %node_id, error = %e, "socket error");
                break;
            },
        }
    }

    state.teardown().await;
    // Every sender clone must drop before the write loop drains and closes.
    drop(state);
    drop(out_tx);
    let _ = writer_task.await;
}

async fn write_loop(mut writer: WsWriter, mut out_rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = out_rx.recv().await {
        match frame.encode() {
            Ok(text) => {
                if writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            },
            Err(e) => warn!(error = %e, "failed to encode outbound frame"),
        }
    }
    let _ = writer.close().await;
}

/// Run the auth phase. Returns the authenticated node id, or `None` when
/// the handshake failed (the caller closes the socket).
async fn authenticate(
    inner: &Arc<ServerInner>,
    writer: &mut WsWriter,
    reader: &mut WsReader,
) -> Option<NodeId> {
    let first = tokio::time::timeout(inner.config.auth_timeout, reader.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        debug!("connection closed or timed out before auth");
        return None;
    };

    let payload = match Frame::decode(text.as_ref()) {
        Ok(Frame::Auth(payload)) => payload,
        Ok(other) => {
            warn!(frame = ?other, "expected auth frame first");
            let _ = send_frame(writer, &auth_result(false, Some("expected auth frame"))).await;
            return None;
        },
        Err(e) => {
            warn!(error = %e, "bad frame during auth");
            return None;
        },
    };

    let ok = credential_valid(inner, &payload).await;
    let reply = auth_result(ok, (!ok).then_some("invalid credential"));
    if send_frame(writer, &reply).await.is_err() {
        return None;
    }
    if !ok {
        warn!(node_id = %payload.node_id, "handshake rejected");
        return None;
    }
    Some(payload.node_id)
}

async fn credential_valid(inner: &Arc<ServerInner>, payload: &AuthPayload) -> bool {
    if inner.validator.validate(&payload.node_id, &payload.token).await {
        return true;
    }
    let verifier = inner.device_verifier.lock().ok().and_then(|slot| slot.clone());
    verifier.is_some_and(|v| v.verify(&payload.node_id, &payload.token))
}

fn auth_result(ok: bool, reason: Option<&str>) -> Frame {
    Frame::AuthResult(AuthResultPayload {
        ok,
        reason: reason.map(str::to_string),
    })
}

async fn send_frame(writer: &mut WsWriter, frame: &Frame) -> GatewayResult<()> {
    let text = frame.encode()?;
    writer.send(Message::Text(text.into())).await?;
    Ok(())
}

struct ConnectionState {
    inner: Arc<ServerInner>,
    connection_id: Uuid,
    node_id: NodeId,
    out_tx: mpsc::UnboundedSender<Frame>,
    registered: bool,
    pump: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ConnectionState {
    async fn handle_frame(&mut self, frame: Frame) -> ControlFlow<()> {
        match frame {
            Frame::Register(payload) => self.handle_register(payload),
            Frame::Message(message) => {
                self.touch();
                let sink = self.inner.outbound.lock().ok().and_then(|slot| slot.clone());
                if let Some(sink) = sink {
                    sink(message);
                } else {
                    debug!(node_id = %self.node_id, "dropping node message: no outbound sink");
                }
                ControlFlow::Continue(())
            },
            Frame::Ack(payload) => {
                self.touch();
                if self.inner.delivery.ack(payload.message_id) {
                    debug!(node_id = %self.node_id, message_id = payload.message_id, "delivery acked");
                }
                ControlFlow::Continue(())
            },
            Frame::Ping => {
                self.touch();
                let _ = self.out_tx.send(Frame::Pong);
                ControlFlow::Continue(())
            },
            Frame::Pong => {
                self.touch();
                ControlFlow::Continue(())
            },
            Frame::Session(payload) => {
                let result = self.inner.sessions.handle_event(&self.node_id, payload.event);
                if !result.valid {
                    debug!(node_id = %self.node_id, event = %payload.event, "session event rejected");
                }
                ControlFlow::Continue(())
            },
            Frame::Auth(_) | Frame::AuthResult(_) => {
                warn!(node_id = %self.node_id, "unexpected handshake frame after auth");
                ControlFlow::Continue(())
            },
        }
    }

    fn handle_register(&mut self, payload: RegisterPayload) -> ControlFlow<()> {
        if payload.node_id != self.node_id {
            warn!(
                authenticated = %self.node_id,
                claimed = %payload.node_id,
                "register rejected: node id does not match credential"
            );
            return ControlFlow::Continue(());
        }

        let node = RegisteredNode::new(self.node_id.clone(), payload.capabilities);
        match self.inner.registry.register(node) {
            Ok(()) => {
                self.inner.sessions.open_session(&self.node_id);
                self.install_dispatcher();
                self.registered = true;
                info!(connection_id = %self.connection_id, node_id = %self.node_id, "node registered");
                self.inner.emitter.publish(RuntimeEvent::NodeConnected {
                    node_id: self.node_id.clone(),
                });
            },
            Err(GatewayError::AlreadyRegistered { .. }) => {
                // The node is returning on a fresh socket. The session
                // machine decides whether this is a legal reconnect.
                let result = self
                    .inner
                    .sessions
                    .handle_event(&self.node_id, SessionEvent::Reconnect);
                if result.valid {
                    self.install_dispatcher();
                    self.registered = true;
                    let record = self.inner.sessions.record(&self.node_id);
                    info!(
                        connection_id = %self.connection_id,
                        node_id = %self.node_id,
                        reconnect_count = record.map_or(0, |r| r.reconnect_count),
                        "node reconnected"
                    );
                    // Redelivery strictly after the machine committed
                    // `connected`.
                    for payload in self.inner.delivery.redeliver(&self.node_id) {
                        let _ = self.out_tx.send(Frame::Message(payload));
                    }
                    self.inner.emitter.publish(RuntimeEvent::NodeConnected {
                        node_id: self.node_id.clone(),
                    });
                } else {
                    warn!(node_id = %self.node_id, "register rejected: session is live elsewhere");
                }
            },
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "registration failed");
            },
        }
        ControlFlow::Continue(())
    }

    fn install_dispatcher(&mut self) {
        self.stop_pump();

        let mut buffer = PriorityBuffer::new(self.inner.config.lanes);
        let preempt = self.inner.preempt.lock().ok().and_then(|slot| slot.clone());
        if let Some(preempt) = preempt {
            let node_id = self.node_id.clone();
            buffer.set_preempt_hook(Arc::new(move |message| preempt(&node_id, message)));
        }

        let buffer = Arc::new(Mutex::new(buffer));
        let notify = Arc::new(Notify::new());
        let dispatcher = Arc::new(NodeDispatcher {
            buffer: Arc::clone(&buffer),
            notify: Arc::clone(&notify),
        });
        self.inner.router.set_dispatcher(self.node_id.clone(), dispatcher);
        self.inner.senders.insert(self.node_id.clone(), self.out_tx.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump_loop(
            self.node_id.clone(),
            buffer,
            notify,
            self.out_tx.clone(),
            Arc::clone(&self.inner),
            cancel.clone(),
        ));
        self.pump = Some((cancel, handle));
    }

    fn stop_pump(&mut self) {
        if let Some((cancel, _handle)) = self.pump.take() {
            cancel.cancel();
        }
    }

    fn touch(&self) {
        if self.registered {
            let _ = self.inner.sessions.handle_event(&self.node_id, SessionEvent::Activity);
        }
    }

    async fn teardown(&mut self) {
        if let Some((cancel, handle)) = self.pump.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        if self.registered {
            // The transport is gone; the session decides what that means
            // (typically `suspended`, awaiting reconnect).
            let result = self
                .inner
                .sessions
                .handle_event(&self.node_id, SessionEvent::Disconnect);
            debug!(
                connection_id = %self.connection_id,
                node_id = %self.node_id,
                next = %result.next,
                "connection closed"
            );
            self.inner.router.remove_dispatcher(&self.node_id);
            self.inner.senders.remove(&self.node_id);
        }
    }
}
