//! HTTP adapter
//!
//! REST ingress plus two streaming surfaces over the same relay core:
//! Server-Sent Events for plain HTTP clients and a JSON WebSocket at
//! /v1/ws that runs the full native session machine. Subscriptions
//! created here live under one synthetic relay connection and apply
//! the same bounded-queue, drop-oldest policy as every other surface.

use crate::dispatch::ConnId;
use crate::outbox::Outbox;
use crate::relay::Relay;
use crate::server::{run_connection, writer_task, ConnError, ConnSettings, FrameSink, FrameSource};
use aether_core::{Event, EventWire, Filter, FilterWire, Reject};
use aether_net::envelope::{FrameFormat, RawFrame};
use aether_net::session::SessionConfig;
use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

struct HttpSub {
    filters: Vec<Filter>,
    outbox: Arc<Outbox>,
    /// A stream may attach at most once at a time (single consumer).
    attached: AtomicBool,
}

pub struct HttpState {
    relay: Arc<Relay>,
    /// All HTTP subscriptions live under one synthetic connection.
    conn: ConnId,
    subs: RwLock<HashMap<String, Arc<HttpSub>>>,
    outbox_capacity: usize,
    hello_timeout: Duration,
    require_noise: bool,
    shutdown_tx: broadcast::Sender<()>,
}

impl HttpState {
    pub fn new(
        relay: Arc<Relay>,
        outbox_capacity: usize,
        hello_timeout: Duration,
        require_noise: bool,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            conn: ConnId::next(),
            subs: RwLock::new(HashMap::new()),
            outbox_capacity,
            hello_timeout,
            require_noise,
            shutdown_tx,
        })
    }
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/v1/events", post(publish_event))
        .route("/v1/subscriptions", post(create_subscription))
        .route("/v1/subscriptions/:id", delete(delete_subscription))
        .route("/v1/stream", get(stream_events))
        .route("/v1/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the adapter until shutdown.
pub async fn run(listener: TcpListener, state: Arc<HttpState>) {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP adapter on {addr}");
    }
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let app = router(state);
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;
}

fn reject_response(reject: &Reject) -> Response {
    let status = match reject {
        Reject::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        Reject::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Reject::SubscriptionNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({ "code": reject.code(), "message": reject.to_string() })),
    )
        .into_response()
}

async fn publish_event(
    State(state): State<Arc<HttpState>>,
    Json(wire): Json<EventWire>,
) -> Response {
    let event = match wire.into_event() {
        Ok(event) => event,
        Err(reject) => return reject_response(&reject),
    };
    let id_hex = hex::encode(event.event_id.0);
    match state.relay.publish(event) {
        Ok(acceptance) => {
            let status = if acceptance.reason() == Some("duplicate") {
                "duplicate"
            } else {
                "accepted"
            };
            (
                StatusCode::ACCEPTED,
                Json(json!({ "event_id": id_hex, "status": status })),
            )
                .into_response()
        }
        Err(reject) => reject_response(&reject),
    }
}

/// The body is either a single filter object or `{"filters": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubscriptionBody {
    Many { filters: Vec<FilterWire> },
    One(FilterWire),
}

async fn create_subscription(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<SubscriptionBody>,
) -> Response {
    let wires = match body {
        SubscriptionBody::Many { filters } => filters,
        SubscriptionBody::One(filter) => vec![filter],
    };
    let mut filters = Vec::with_capacity(wires.len());
    for wire in wires {
        match wire.normalize() {
            Ok(filter) => filters.push(filter),
            Err(reject) => return reject_response(&reject),
        }
    }

    let sub_id = hex::encode(rand::random::<[u8; 16]>());
    let outbox = state.relay.dispatcher().register(
        state.conn,
        sub_id.clone(),
        filters.clone(),
        Some(state.outbox_capacity),
    );
    state.subs.write().insert(
        sub_id.clone(),
        Arc::new(HttpSub {
            filters,
            outbox,
            attached: AtomicBool::new(false),
        }),
    );

    debug!(%sub_id, "http subscription created");
    (
        StatusCode::CREATED,
        Json(json!({ "subscription_id": sub_id })),
    )
        .into_response()
}

async fn delete_subscription(
    State(state): State<Arc<HttpState>>,
    Path(sub_id): Path<String>,
) -> Response {
    match state.subs.write().remove(&sub_id) {
        Some(_) => {
            state.relay.dispatcher().unregister(state.conn, &sub_id);
            StatusCode::NO_CONTENT.into_response()
        }
        None => reject_response(&Reject::SubscriptionNotFound),
    }
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    subscription_id: String,
}

fn event_sse(event: &Event) -> SseEvent {
    let wire = EventWire::from_event(event);
    SseEvent::default()
        .event("event")
        .data(serde_json::to_string(&wire).unwrap_or_default())
}

/// Releases the single-consumer slot when the SSE stream drops.
struct AttachGuard(Arc<HttpSub>);

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.0.attached.store(false, Ordering::Release);
    }
}

async fn stream_events(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<StreamParams>,
) -> Response {
    let Some(sub) = state.subs.read().get(&params.subscription_id).cloned() else {
        return reject_response(&Reject::SubscriptionNotFound);
    };
    if sub.attached.swap(true, Ordering::AcqRel) {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "code": Reject::InvalidMessage.code(),
                "message": "stream already attached",
            })),
        )
            .into_response();
    }
    let guard = AttachGuard(sub.clone());

    let backfill = match state.relay.backfill(&sub.filters) {
        Ok(events) => events,
        Err(reject) => return reject_response(&reject),
    };
    let backfill_stream = stream::iter(
        backfill
            .iter()
            .map(event_sse)
            .chain(std::iter::once(SseEvent::default().event("eose").data("{}")))
            .map(Ok::<_, Infallible>)
            .collect::<Vec<_>>(),
    );

    let outbox = sub.outbox.clone();
    let live = stream::unfold((outbox, guard), |(outbox, guard)| async move {
        match outbox.pop().await {
            Some(event) => {
                let item = Ok::<_, Infallible>(event_sse(&event));
                Some((item, (outbox, guard)))
            }
            None => None,
        }
    });

    let combined: Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>> =
        Box::pin(backfill_stream.chain(live));
    Sse::new(combined)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

async fn healthz(State(state): State<Arc<HttpState>>) -> Json<Value> {
    let subscriptions: Vec<Value> = state
        .relay
        .dispatcher()
        .subscription_stats()
        .into_iter()
        .map(|s| {
            json!({
                "conn": s.conn.0,
                "sub_id": s.sub_id,
                "delivered": s.stats.delivered,
                "dropped": s.stats.dropped,
                "queue_high_water": s.stats.queue_high_water,
                "depth": s.stats.depth,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "events": state.relay.metrics().snapshot(),
        "stored": state.relay.store().event_count(),
        "subscriptions": subscriptions,
    }))
}

// ---------------------------------------------------------------------------
// /v1/ws: native session semantics in JSON
// ---------------------------------------------------------------------------

struct AxumWsSink(futures_util::stream::SplitSink<WebSocket, AxMessage>);

impl FrameSink for AxumWsSink {
    async fn send_frame(&mut self, frame: RawFrame) -> Result<(), ConnError> {
        use futures_util::SinkExt;
        let msg = match frame {
            RawFrame::Text(text) => AxMessage::Text(text),
            RawFrame::Binary(bytes) => AxMessage::Binary(bytes),
        };
        self.0.send(msg).await.map_err(|e| ConnError::Ws(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), ConnError> {
        use futures_util::SinkExt;
        self.0
            .send(AxMessage::Ping(Vec::new()))
            .await
            .map_err(|e| ConnError::Ws(e.to_string()))
    }

    async fn close(&mut self) {
        use futures_util::SinkExt;
        let _ = self.0.close().await;
    }
}

struct AxumWsSource(futures_util::stream::SplitStream<WebSocket>);

impl FrameSource for AxumWsSource {
    async fn next_frame(&mut self) -> Option<Result<RawFrame, ConnError>> {
        loop {
            match self.0.next().await? {
                Ok(AxMessage::Text(text)) => return Some(Ok(RawFrame::Text(text))),
                Ok(AxMessage::Binary(bytes)) => return Some(Ok(RawFrame::Binary(bytes))),
                Ok(AxMessage::Ping(_) | AxMessage::Pong(_)) => continue,
                Ok(AxMessage::Close(_)) => return None,
                Err(e) => return Some(Err(ConnError::Ws(e.to_string()))),
            }
        }
    }
}

async fn ws_upgrade(State(state): State<Arc<HttpState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_json_ws(socket, state))
}

async fn handle_json_ws(socket: WebSocket, state: Arc<HttpState>) {
    let (sink, src) = socket.split();
    let (writer_tx, writer_rx) = mpsc::channel(64);
    tokio::spawn(writer_task(
        AxumWsSink(sink),
        writer_rx,
        Duration::from_secs(30),
    ));

    let settings = ConnSettings {
        session: SessionConfig {
            require_noise: state.require_noise,
            allowed_formats: vec![FrameFormat::Json],
        },
        hello_timeout: state.hello_timeout,
        outbox_capacity: state.outbox_capacity,
    };
    run_connection(
        AxumWsSource(src),
        writer_tx,
        state.relay.clone(),
        settings,
        state.shutdown_tx.subscribe(),
    )
    .await;
}
