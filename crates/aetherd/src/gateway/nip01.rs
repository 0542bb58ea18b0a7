//! NIP-01 text protocol adapter
//!
//! WebSocket frames are JSON arrays: inbound `["EVENT", {...}]`,
//! `["REQ", sub_id, filter...]`, `["CLOSE", sub_id]`; outbound
//! `["OK", id, accepted, message]`, `["EVENT", sub_id, {...}]`,
//! `["EOSE", sub_id]`, `["NOTICE", text]`. The adapter translates the
//! `id` alias and hex fields through the shared wire types, so ids are
//! bit-identical with every other surface. EOSE is always emitted at
//! the end of backfill, even when the backfill is empty.

use crate::outbox::Outbox;
use crate::relay::Relay;
use aether_core::{Event, EventWire, Filter, FilterWire, Reject};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info};

/// One parsed inbound frame.
#[derive(Debug, PartialEq)]
pub(crate) enum ClientFrame {
    Event(Box<EventWire>),
    Req {
        sub_id: String,
        filters: Vec<FilterWire>,
    },
    Close(String),
}

pub(crate) fn parse_frame(text: &str) -> Result<ClientFrame, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let array = value.as_array().ok_or("frame must be an array")?;
    let verb = array
        .first()
        .and_then(Value::as_str)
        .ok_or("missing frame verb")?;

    match verb {
        "EVENT" => {
            let raw = array.get(1).ok_or("EVENT needs a payload")?;
            let event: EventWire =
                serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
            Ok(ClientFrame::Event(Box::new(event)))
        }
        "REQ" => {
            let sub_id = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or("REQ needs a subscription id")?
                .to_owned();
            let mut filters = Vec::new();
            for raw in &array[2..] {
                filters.push(serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?);
            }
            Ok(ClientFrame::Req { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or("CLOSE needs a subscription id")?
                .to_owned();
            Ok(ClientFrame::Close(sub_id))
        }
        other => Err(format!("unknown verb {other:?}")),
    }
}

/// NIP-01 event object: same wire shape, `id` instead of `event_id`.
pub(crate) fn event_json(event: &Event) -> Value {
    let wire = EventWire::from_event(event);
    json!({
        "id": wire.event_id,
        "pubkey": wire.pubkey,
        "created_at": wire.created_at,
        "kind": wire.kind,
        "tags": wire.tags,
        "content": wire.content,
        "sig": wire.sig,
    })
}

pub(crate) fn ok_frame(event_id: &str, accepted: bool, message: &str) -> String {
    json!(["OK", event_id, accepted, message]).to_string()
}

pub(crate) fn event_frame(sub_id: &str, event: &Event) -> String {
    json!(["EVENT", sub_id, event_json(event)]).to_string()
}

pub(crate) fn eose_frame(sub_id: &str) -> String {
    json!(["EOSE", sub_id]).to_string()
}

pub(crate) fn notice_frame(text: &str) -> String {
    json!(["NOTICE", text]).to_string()
}

/// Run the adapter until shutdown.
pub async fn run(
    listener: TcpListener,
    relay: Arc<Relay>,
    outbox_capacity: usize,
    shutdown_tx: broadcast::Sender<()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("NIP-01 adapter on {addr}"),
        Err(_) => info!("NIP-01 adapter running"),
    }
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    debug!("nip01 connection from {addr}");
                    let relay = relay.clone();
                    let shutdown = shutdown_tx.subscribe();
                    tokio::spawn(handle_conn(stream, relay, outbox_capacity, shutdown));
                }
                Err(e) => error!("nip01 accept error: {e}"),
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn handle_conn(
    stream: TcpStream,
    relay: Arc<Relay>,
    outbox_capacity: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("nip01 handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut src) = ws.split();
    let conn_id = crate::dispatch::ConnId::next();

    // All outbound text funnels through one writer so subscription
    // drains and command replies interleave without tearing.
    let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(30));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;
        loop {
            tokio::select! {
                line = writer_rx.recv() => match line {
                    Some(line) => {
                        if sink.send(WsMessage::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let text = tokio::select! {
            frame = src.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => text.to_string(),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Binary(_))) => {
                    let _ = writer_tx.send(notice_frame("invalid_message: text frames only")).await;
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("nip01 transport error: {e}");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        };

        match parse_frame(&text) {
            Err(detail) => {
                let _ = writer_tx
                    .send(notice_frame(&format!("invalid_message: {detail}")))
                    .await;
            }
            Ok(ClientFrame::Event(wire)) => {
                let reply = publish(&relay, *wire);
                let _ = writer_tx.send(reply).await;
            }
            Ok(ClientFrame::Req { sub_id, filters }) => {
                match subscribe(&relay, conn_id, &sub_id, filters, outbox_capacity) {
                    Err(reject) => {
                        let _ = writer_tx.send(notice_frame(reject.code())).await;
                    }
                    Ok((outbox, backfill)) => {
                        for event in &backfill {
                            let _ = writer_tx.send(event_frame(&sub_id, event)).await;
                        }
                        let _ = writer_tx.send(eose_frame(&sub_id)).await;
                        tokio::spawn(drain(outbox, sub_id, writer_tx.clone()));
                    }
                }
            }
            Ok(ClientFrame::Close(sub_id)) => {
                if let Err(reject) = relay.unsubscribe(conn_id, &sub_id) {
                    let _ = writer_tx.send(notice_frame(reject.code())).await;
                }
            }
        }
    }

    relay.drop_conn(conn_id);
    drop(writer_tx);
    let _ = writer.await;
}

fn publish(relay: &Relay, wire: EventWire) -> String {
    let submitted_id = wire.event_id.clone();
    match wire.into_event() {
        Err(reject) => ok_frame(&submitted_id, false, reject.code()),
        Ok(event) => {
            let id_hex = hex::encode(event.event_id.0);
            match relay.publish(event) {
                Ok(acceptance) => ok_frame(&id_hex, true, acceptance.reason().unwrap_or("")),
                Err(reject) => ok_frame(&id_hex, false, reject.code()),
            }
        }
    }
}

fn subscribe(
    relay: &Relay,
    conn_id: crate::dispatch::ConnId,
    sub_id: &str,
    filters: Vec<FilterWire>,
    outbox_capacity: usize,
) -> Result<(Arc<Outbox>, Vec<Event>), Reject> {
    let normalized: Vec<Filter> = filters
        .into_iter()
        .map(FilterWire::normalize)
        .collect::<Result<_, _>>()?;
    relay.subscribe(conn_id, sub_id, normalized, Some(outbox_capacity))
}

async fn drain(outbox: Arc<Outbox>, sub_id: String, writer: mpsc::Sender<String>) {
    while let Some(event) = outbox.pop().await {
        if writer.send(event_frame(&sub_id, &event)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_core::crypto::KeyPair;
    use aether_core::Tag;

    #[test]
    fn parses_event_frames_with_id_alias() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let event = kp.sign_event(1, 1, vec![Tag::new("d", vec!["x".into()])], b"hi".to_vec());
        let text = json!(["EVENT", event_json(&event)]).to_string();

        let ClientFrame::Event(wire) = parse_frame(&text).unwrap() else {
            panic!("expected EVENT")
        };
        // The id alias and hex round-trip reproduce the exact event.
        assert_eq!(wire.into_event().unwrap(), event);
    }

    #[test]
    fn parses_req_with_multiple_filters() {
        let text = r#"["REQ", "sub-1", {"kinds": [1]}, {"tags": {"c": ["vision"]}}]"#;
        let ClientFrame::Req { sub_id, filters } = parse_frame(text).unwrap() else {
            panic!("expected REQ")
        };
        assert_eq!(sub_id, "sub-1");
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn parses_close_and_rejects_garbage() {
        assert_eq!(
            parse_frame(r#"["CLOSE", "s"]"#).unwrap(),
            ClientFrame::Close("s".into())
        );
        assert!(parse_frame(r#"{"not": "an array"}"#).is_err());
        assert!(parse_frame(r#"["UNKNOWN", 1]"#).is_err());
        assert!(parse_frame(r#"["REQ"]"#).is_err());
    }

    #[test]
    fn outbound_frames_have_the_nip01_shape() {
        let kp = KeyPair::from_seed(&[2; 32]);
        let event = kp.sign_event(7, 1, vec![], b"x".to_vec());

        let ok: Value = serde_json::from_str(&ok_frame("aabb", true, "duplicate")).unwrap();
        assert_eq!(ok[0], "OK");
        assert_eq!(ok[2], true);

        let push: Value = serde_json::from_str(&event_frame("s", &event)).unwrap();
        assert_eq!(push[0], "EVENT");
        assert_eq!(push[1], "s");
        assert_eq!(push[2]["id"], hex::encode(event.event_id.0));
        assert_eq!(push[2]["kind"], 1);

        let eose: Value = serde_json::from_str(&eose_frame("s")).unwrap();
        assert_eq!(eose[0], "EOSE");

        let notice: Value = serde_json::from_str(&notice_frame("oops")).unwrap();
        assert_eq!(notice[0], "NOTICE");
    }
}
