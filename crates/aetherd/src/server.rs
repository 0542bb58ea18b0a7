//! Native gateway and relay lifecycle
//!
//! One connection driver serves every session-speaking transport:
//! WebSocket, QUIC, and the HTTP adapter's JSON WebSocket. Per
//! connection, a reader loop feeds the session state machine in arrival
//! order while a writer task owns the negotiated format and the sealing
//! key, so outbound frames stay FIFO and counters stay monotonic.
//! Subscription drains are separate tasks that forward from the bounded
//! outbox into the writer.

use crate::config::Config;
use crate::dispatch::ConnId;
use crate::outbox::Outbox;
use crate::relay::{MetricsSnapshot, Relay};
use aether_core::{EventWire, Filter, Reject};
use aether_net::envelope::{CodecError, FrameCodec, FrameFormat, RawFrame};
use aether_net::messages::{Ack, ErrorMsg, EventPush, Message};
use aether_net::noise::NoiseTx;
use aether_net::session::{seal_and_encode, ClientCommand, Session, SessionConfig, SessionOutput};
use futures_util::{SinkExt, StreamExt};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("storage error: {0}")]
    Storage(#[from] crate::store::StoreError),
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("quic error: {0}")]
    Quic(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Commands consumed by a connection's writer task.
pub(crate) enum WriterCmd {
    SetFormat(FrameFormat),
    EnableNoise(NoiseTx),
    Msg(Message),
}

/// Outbound half of a transport.
pub(crate) trait FrameSink: Send {
    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), ConnError>;
    async fn send_ping(&mut self) -> Result<(), ConnError>;
    async fn close(&mut self);
}

/// Inbound half of a transport. Implementations skip transport-level
/// control frames (pings, pongs) and yield `None` on close.
pub(crate) trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<RawFrame, ConnError>>;
}

// ---------------------------------------------------------------------------
// WebSocket transport (tokio-tungstenite)
// ---------------------------------------------------------------------------

pub(crate) struct WsSink(
    pub futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
);

impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), ConnError> {
        let msg = match frame {
            RawFrame::Binary(bytes) => WsMessage::Binary(bytes.into()),
            RawFrame::Text(text) => WsMessage::Text(text.into()),
        };
        self.0.send(msg).await.map_err(|e| ConnError::Ws(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), ConnError> {
        self.0
            .send(WsMessage::Ping(Vec::new().into()))
            .await
            .map_err(|e| ConnError::Ws(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(WsMessage::Close(None)).await;
        let _ = self.0.close().await;
    }
}

pub(crate) struct WsSource(
    pub futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
);

impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<RawFrame, ConnError>> {
        loop {
            match self.0.next().await? {
                Ok(WsMessage::Binary(bytes)) => return Some(Ok(RawFrame::Binary(bytes.to_vec()))),
                Ok(WsMessage::Text(text)) => return Some(Ok(RawFrame::Text(text.to_string()))),
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Ok(WsMessage::Close(_)) => return None,
                Err(e) => return Some(Err(ConnError::Ws(e.to_string()))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// QUIC transport (quinn): length-prefixed envelopes on one bi stream
// ---------------------------------------------------------------------------

pub(crate) struct QuicSink(pub FramedWrite<quinn::SendStream, FrameCodec>);

impl FrameSink for QuicSink {
    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), ConnError> {
        match frame {
            RawFrame::Binary(bytes) => self
                .0
                .send(bytes)
                .await
                .map_err(|e| ConnError::Quic(e.to_string())),
            RawFrame::Text(_) => Err(ConnError::Quic(
                "text frame on a stream transport".into(),
            )),
        }
    }

    async fn send_ping(&mut self) -> Result<(), ConnError> {
        // QUIC has its own keepalive machinery.
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.get_mut().finish();
    }
}

pub(crate) struct QuicSource(pub FramedRead<quinn::RecvStream, FrameCodec>);

impl FrameSource for QuicSource {
    async fn next_frame(&mut self) -> Option<Result<RawFrame, ConnError>> {
        match self.0.next().await? {
            Ok(bytes) => Some(Ok(RawFrame::Binary(bytes))),
            Err(e) => Some(Err(ConnError::Codec(e))),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection driver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct ConnSettings {
    pub session: SessionConfig,
    pub hello_timeout: Duration,
    pub outbox_capacity: usize,
}

pub(crate) async fn writer_task<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<WriterCmd>,
    ping_interval: Duration,
) {
    let mut format = FrameFormat::Binary;
    let mut noise: Option<NoiseTx> = None;
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // discard the immediate first tick

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => break,
                Some(WriterCmd::SetFormat(f)) => format = f,
                Some(WriterCmd::EnableNoise(tx)) => noise = Some(tx),
                Some(WriterCmd::Msg(msg)) => {
                    match seal_and_encode(&msg, format, noise.as_mut()) {
                        Ok(raw) => {
                            if sink.send_frame(raw).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("outbound encode failed: {e}");
                            break;
                        }
                    }
                }
            },
            _ = ticker.tick() => {
                if sink.send_ping().await.is_err() {
                    break;
                }
            }
        }
    }
    sink.close().await;
}

/// Forward one subscription's outbox to the connection writer. Ends
/// when the outbox closes (unsubscribe or connection teardown) or the
/// writer is gone.
pub(crate) async fn drain_task(
    outbox: Arc<Outbox>,
    sub_id: String,
    writer: mpsc::Sender<WriterCmd>,
) {
    while let Some(event) = outbox.pop().await {
        let push = Message::Event(EventPush {
            sub_id: sub_id.clone(),
            event: EventWire::from_event(&event),
        });
        if writer.send(WriterCmd::Msg(push)).await.is_err() {
            break;
        }
    }
}

pub(crate) struct ConnDriver {
    conn_id: ConnId,
    relay: Arc<Relay>,
    session: Session,
    writer: mpsc::Sender<WriterCmd>,
    outbox_capacity: usize,
}

impl ConnDriver {
    pub(crate) fn new(
        relay: Arc<Relay>,
        session_cfg: SessionConfig,
        writer: mpsc::Sender<WriterCmd>,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            conn_id: ConnId::next(),
            relay,
            session: Session::new(session_cfg),
            writer,
            outbox_capacity,
        }
    }

    pub(crate) fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    async fn send(&self, msg: Message) {
        let _ = self.writer.send(WriterCmd::Msg(msg)).await;
    }

    /// Feed one frame through the session. Returns false when the
    /// connection must close.
    pub(crate) async fn on_frame(&mut self, raw: RawFrame) -> bool {
        for output in self.session.on_frame(&raw) {
            match output {
                SessionOutput::SetFormat(f) => {
                    let _ = self.writer.send(WriterCmd::SetFormat(f)).await;
                }
                SessionOutput::EnableNoise(tx) => {
                    let _ = self.writer.send(WriterCmd::EnableNoise(tx)).await;
                }
                SessionOutput::Send(msg) => self.send(msg).await,
                SessionOutput::Command(cmd) => self.handle_command(cmd).await,
                SessionOutput::Close => return false,
            }
        }
        true
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Publish(wire) => {
                let submitted_id = wire.event_id.clone();
                let ack = match wire.into_event() {
                    Err(reject) => Ack {
                        event_id: submitted_id,
                        accepted: false,
                        reason: Some(reject.code().into()),
                    },
                    Ok(event) => {
                        let id_hex = hex::encode(event.event_id.0);
                        match self.relay.publish(event) {
                            Ok(acceptance) => Ack {
                                event_id: id_hex,
                                accepted: true,
                                reason: acceptance.reason().map(Into::into),
                            },
                            Err(reject) => Ack {
                                event_id: id_hex,
                                accepted: false,
                                reason: Some(reject.code().into()),
                            },
                        }
                    }
                };
                self.send(Message::Ack(ack)).await;
            }
            ClientCommand::Subscribe { sub_id, filters } => {
                let mut normalized = Vec::with_capacity(filters.len());
                for wire in filters {
                    match wire.normalize() {
                        Ok(filter) => normalized.push(filter),
                        Err(reject) => {
                            self.send(Message::Error(ErrorMsg::new(
                                reject.code(),
                                reject.to_string(),
                            )))
                            .await;
                            return;
                        }
                    }
                }
                self.subscribe(sub_id, normalized).await;
            }
            ClientCommand::Unsubscribe { sub_id } => {
                if let Err(reject) = self.relay.unsubscribe(self.conn_id, &sub_id) {
                    self.send(Message::Error(ErrorMsg::new(
                        reject.code(),
                        reject.to_string(),
                    )))
                    .await;
                }
            }
        }
    }

    async fn subscribe(&mut self, sub_id: String, filters: Vec<Filter>) {
        match self.relay.subscribe(
            self.conn_id,
            sub_id.clone(),
            filters,
            Some(self.outbox_capacity),
        ) {
            Ok((outbox, backfill)) => {
                for event in &backfill {
                    self.send(Message::Event(EventPush {
                        sub_id: sub_id.clone(),
                        event: EventWire::from_event(event),
                    }))
                    .await;
                }
                // The native surface has no end-of-backfill marker; live
                // dispatch begins as soon as the drain attaches.
                tokio::spawn(drain_task(outbox, sub_id, self.writer.clone()));
            }
            Err(reject) => {
                self.send(Message::Error(ErrorMsg::new(
                    reject.code(),
                    reject.to_string(),
                )))
                .await;
            }
        }
    }
}

/// Drive one connection to completion: HELLO deadline first, then
/// frames in arrival order until close or shutdown.
pub(crate) async fn run_connection<Src: FrameSource>(
    mut src: Src,
    writer: mpsc::Sender<WriterCmd>,
    relay: Arc<Relay>,
    settings: ConnSettings,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut driver = ConnDriver::new(
        relay.clone(),
        settings.session,
        writer,
        settings.outbox_capacity,
    );
    let conn_id = driver.conn_id();

    let mut alive = match tokio::time::timeout(settings.hello_timeout, src.next_frame()).await {
        Err(_) => {
            driver
                .send(Message::Error(ErrorMsg::new(
                    Reject::InvalidMessage.code(),
                    "hello deadline exceeded",
                )))
                .await;
            false
        }
        Ok(None) | Ok(Some(Err(_))) => false,
        Ok(Some(Ok(raw))) => driver.on_frame(raw).await,
    };

    while alive {
        tokio::select! {
            frame = src.next_frame() => match frame {
                Some(Ok(raw)) => alive = driver.on_frame(raw).await,
                Some(Err(e)) => {
                    debug!(%conn_id, "transport error: {e}");
                    alive = false;
                }
                None => alive = false,
            },
            _ = shutdown.recv() => alive = false,
        }
    }

    relay.drop_conn(conn_id);
    debug!(%conn_id, "connection closed");
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Build the QUIC endpoint from PEM material on disk.
pub fn build_quic_endpoint(
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
) -> Result<quinn::Endpoint, ServerError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let key: PrivateKeyDer<'static> =
        PrivateKeyDer::from_pem_file(key_path).map_err(|e| ServerError::Tls(e.to_string()))?;

    let server_config = quinn::ServerConfig::with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(quinn::Endpoint::server(server_config, addr)?)
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub events: MetricsSnapshot,
}

/// The native gateway plus relay-wide background tasks.
pub struct Server {
    config: Config,
    relay: Arc<Relay>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config, relay: Arc<Relay>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            relay,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Handle the gateways use to observe (and share) shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::Relaxed),
            subscriptions: self.relay.dispatcher().subscription_count(),
            events: self.relay.metrics().snapshot(),
        }
    }

    fn conn_settings(&self, formats: Vec<FrameFormat>) -> ConnSettings {
        ConnSettings {
            session: SessionConfig {
                require_noise: self.config.noise_required,
                allowed_formats: formats,
            },
            hello_timeout: Duration::from_secs(self.config.hello_timeout_secs),
            outbox_capacity: self.config.outbox_capacity,
        }
    }

    /// Run the native gateway until shutdown.
    pub async fn run(
        &self,
        native: TcpListener,
        quic: Option<quinn::Endpoint>,
    ) -> Result<(), ServerError> {
        info!("native gateway on {}", native.local_addr()?);
        if quic.is_some() {
            info!("QUIC gateway on {}", self.config.quic_listen);
        }

        let gc_handle = self.spawn_gc_task();
        let ping = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = native.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {addr}");
                        let relay = self.relay.clone();
                        let settings = self.conn_settings(vec![FrameFormat::Binary, FrameFormat::Json]);
                        let shutdown = self.shutdown_tx.subscribe();
                        let connections = self.connections.clone();
                        tokio::spawn(async move {
                            connections.fetch_add(1, Ordering::Relaxed);
                            handle_ws(stream, relay, settings, ping, shutdown).await;
                            connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                incoming = accept_quic(&quic) => {
                    if let Some(incoming) = incoming {
                        let relay = self.relay.clone();
                        // Stream transports negotiate the binary format only.
                        let settings = self.conn_settings(vec![FrameFormat::Binary]);
                        let shutdown = self.shutdown_tx.subscribe();
                        let connections = self.connections.clone();
                        tokio::spawn(async move {
                            connections.fetch_add(1, Ordering::Relaxed);
                            handle_quic(incoming, relay, settings, ping, shutdown).await;
                            connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        gc_handle.abort();
        self.relay.store().flush()?;
        Ok(())
    }

    fn spawn_gc_task(&self) -> tokio::task::JoinHandle<()> {
        let relay = self.relay.clone();
        let interval = Duration::from_secs(self.config.gc_interval_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => match relay.gc() {
                        Ok(0) => {}
                        Ok(dropped) => info!("gc dropped {dropped} expired events"),
                        Err(e) => warn!("gc failed: {e}"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

async fn accept_quic(endpoint: &Option<quinn::Endpoint>) -> Option<quinn::Incoming> {
    match endpoint {
        Some(endpoint) => endpoint.accept().await,
        None => std::future::pending().await,
    }
}

async fn handle_ws(
    stream: TcpStream,
    relay: Arc<Relay>,
    settings: ConnSettings,
    ping: Duration,
    shutdown: broadcast::Receiver<()>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("websocket handshake failed: {e}");
            return;
        }
    };
    let (sink, src) = ws.split();
    let (writer_tx, writer_rx) = mpsc::channel(64);
    tokio::spawn(writer_task(WsSink(sink), writer_rx, ping));
    run_connection(WsSource(src), writer_tx, relay, settings, shutdown).await;
}

async fn handle_quic(
    incoming: quinn::Incoming,
    relay: Arc<Relay>,
    settings: ConnSettings,
    ping: Duration,
    shutdown: broadcast::Receiver<()>,
) {
    let connection = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("quic handshake failed: {e}");
            return;
        }
    };
    let (send, recv) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!("quic stream setup failed: {e}");
            return;
        }
    };

    let sink = QuicSink(FramedWrite::new(send, FrameCodec::new()));
    let src = QuicSource(FramedRead::new(recv, FrameCodec::new()));
    let (writer_tx, writer_rx) = mpsc::channel(64);
    tokio::spawn(writer_task(sink, writer_rx, ping));
    run_connection(src, writer_tx, relay, settings, shutdown).await;
}
