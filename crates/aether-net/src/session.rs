//! Per-connection session state machine
//!
//! `NEW → ACTIVE → CLOSED`, with the WELCOME reply marking the
//! transition out of NEW. The machine is pure: it consumes decoded
//! frames and emits outputs for the transport driver to act on, so the
//! same logic runs over WebSocket, QUIC, and the JSON WebSocket of the
//! HTTP adapter.
//!
//! Protocol errors (malformed frames, handshake violations) close the
//! session. A well-formed but unexpected message type yields an ERROR
//! and the session stays ACTIVE.

use crate::envelope::{CodecError, FrameFormat, RawFrame};
use crate::messages::{
    ErrorMsg, Hello, Message, NoiseAccept, NoisePayload, Welcome, PROTOCOL_VERSION,
};
use crate::noise::{server_accept, NoiseRx, NoiseTx};

/// AEAD failures tolerated before the session is torn down.
const MAX_NOISE_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Force the transport-encryption upgrade even when the client does
    /// not ask for it
    pub require_noise: bool,
    /// Formats this listener is willing to negotiate
    pub allowed_formats: Vec<FrameFormat>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            require_noise: false,
            allowed_formats: vec![FrameFormat::Binary, FrameFormat::Json],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    Active,
    Closed,
}

/// Application-level commands extracted from a session.
#[derive(Clone, Debug)]
pub enum ClientCommand {
    Publish(aether_core::EventWire),
    Subscribe {
        sub_id: String,
        filters: Vec<aether_core::FilterWire>,
    },
    Unsubscribe {
        sub_id: String,
    },
}

/// What the transport driver must do with a processed frame.
pub enum SessionOutput {
    /// Negotiated format for all outbound frames from here on
    SetFormat(FrameFormat),
    /// Send a protocol message to the peer
    Send(Message),
    /// Wrap subsequent outbound frames with this sealing key
    EnableNoise(NoiseTx),
    /// Hand an application command to the relay
    Command(ClientCommand),
    /// Terminate the connection
    Close,
}

pub struct Session {
    cfg: SessionConfig,
    state: SessionState,
    format: FrameFormat,
    noise_rx: Option<NoiseRx>,
}

impl Session {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            cfg,
            state: SessionState::New,
            format: FrameFormat::Binary,
            noise_rx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Process one inbound frame.
    pub fn on_frame(&mut self, raw: &RawFrame) -> Vec<SessionOutput> {
        if self.state == SessionState::Closed {
            return vec![];
        }

        let mut outputs = Vec::new();
        if self.state == SessionState::New {
            // Until negotiation completes, replies mirror the shape of
            // what the client sent.
            let shape = match raw {
                RawFrame::Binary(_) => FrameFormat::Binary,
                RawFrame::Text(_) => FrameFormat::Json,
            };
            self.format = shape;
            outputs.push(SessionOutput::SetFormat(shape));
        }

        let msg = match Message::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                outputs.extend(self.protocol_error(&e.to_string()));
                return outputs;
            }
        };

        let rest = match self.state {
            SessionState::New => match msg {
                Message::Hello(hello) => self.handshake(hello),
                _ => self.protocol_error("expected hello"),
            },
            SessionState::Active => self.handle_active(msg, false),
            SessionState::Closed => vec![],
        };
        outputs.extend(rest);
        outputs
    }

    fn handshake(&mut self, hello: Hello) -> Vec<SessionOutput> {
        if hello.version != PROTOCOL_VERSION {
            return self.protocol_error("unsupported protocol version");
        }

        let offered: Vec<FrameFormat> = hello
            .formats
            .iter()
            .filter_map(|s| FrameFormat::from_str(s))
            .collect();
        // Binary is the stronger format; fall back to JSON.
        let format = [FrameFormat::Binary, FrameFormat::Json]
            .into_iter()
            .find(|f| offered.contains(f) && self.cfg.allowed_formats.contains(f));
        let format = match format {
            Some(f) => f,
            None => return self.protocol_error("no mutually supported format"),
        };
        self.format = format;

        let client_requires = hello.noise.as_ref().map(|n| n.required).unwrap_or(false);
        let require_noise = self.cfg.require_noise || client_requires;

        let mut outputs = vec![SessionOutput::SetFormat(format)];
        if require_noise {
            let client_pub = hello
                .noise
                .as_ref()
                .and_then(|n| n.pubkey.as_deref())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok());
            let client_pub = match client_pub {
                Some(pk) => pk,
                None => return self.protocol_error("noise upgrade requires a public key"),
            };
            let (tx, rx, server_pub) = match server_accept(&client_pub) {
                Ok(v) => v,
                Err(e) => return self.protocol_error(&e.to_string()),
            };
            self.noise_rx = Some(rx);
            outputs.push(SessionOutput::Send(Message::Welcome(Welcome {
                version: PROTOCOL_VERSION,
                format: format.as_str().into(),
                noise: Some(NoiseAccept {
                    required: true,
                    pubkey: hex::encode(server_pub),
                }),
            })));
            outputs.push(SessionOutput::EnableNoise(tx));
        } else {
            outputs.push(SessionOutput::Send(Message::Welcome(Welcome {
                version: PROTOCOL_VERSION,
                format: format.as_str().into(),
                noise: None,
            })));
        }

        self.state = SessionState::Active;
        outputs
    }

    fn handle_active(&mut self, msg: Message, unwrapped: bool) -> Vec<SessionOutput> {
        // Once the encrypted channel is up, cleartext application frames
        // would defeat the upgrade.
        if self.noise_rx.is_some() && !unwrapped && !matches!(msg, Message::Noise(_)) {
            return self.protocol_error("cleartext frame on encrypted session");
        }

        match msg {
            Message::Noise(payload) => self.handle_noise(payload, unwrapped),
            Message::Publish(p) => vec![SessionOutput::Command(ClientCommand::Publish(p.event))],
            Message::Subscribe(s) => vec![SessionOutput::Command(ClientCommand::Subscribe {
                sub_id: s.sub_id,
                filters: s.filters,
            })],
            Message::Unsubscribe(u) => {
                vec![SessionOutput::Command(ClientCommand::Unsubscribe {
                    sub_id: u.sub_id,
                })]
            }
            // Informational; nothing to do.
            Message::Error(_) => vec![],
            Message::Hello(_) | Message::Welcome(_) | Message::Ack(_) | Message::Event(_) => {
                vec![SessionOutput::Send(Message::Error(ErrorMsg::new(
                    "invalid_message",
                    "unexpected message type",
                )))]
            }
        }
    }

    fn handle_noise(&mut self, payload: NoisePayload, unwrapped: bool) -> Vec<SessionOutput> {
        if unwrapped {
            return self.protocol_error("nested noise envelope");
        }
        let Some(rx) = self.noise_rx.as_mut() else {
            return vec![SessionOutput::Send(Message::Error(ErrorMsg::new(
                "invalid_message",
                "session is not encrypted",
            )))];
        };

        let sealed = match hex::decode(&payload.payload_hex) {
            Ok(b) => b,
            Err(_) => return self.protocol_error("noise payload is not valid hex"),
        };

        let plaintext = match rx.open(&sealed) {
            Ok(pt) => pt,
            Err(e) => {
                if rx.failures() >= MAX_NOISE_FAILURES {
                    return self.protocol_error("repeated decryption failures");
                }
                return vec![SessionOutput::Send(Message::Error(ErrorMsg::new(
                    "invalid_message",
                    e.to_string(),
                )))];
            }
        };

        let inner = match self.format {
            FrameFormat::Binary => RawFrame::Binary(plaintext),
            FrameFormat::Json => match String::from_utf8(plaintext) {
                Ok(text) => RawFrame::Text(text),
                Err(_) => return self.protocol_error("inner frame is not UTF-8"),
            },
        };
        match Message::decode(&inner) {
            Ok(msg) => self.handle_active(msg, true),
            Err(e) => self.protocol_error(&e.to_string()),
        }
    }

    fn protocol_error(&mut self, detail: &str) -> Vec<SessionOutput> {
        self.state = SessionState::Closed;
        vec![
            SessionOutput::Send(Message::Error(ErrorMsg::new("invalid_message", detail))),
            SessionOutput::Close,
        ]
    }
}

/// Encode an outbound message for the negotiated format, sealing it when
/// the encrypted channel is active. WELCOME itself is emitted before the
/// driver enables sealing, so no special case is needed here.
pub fn seal_and_encode(
    msg: &Message,
    format: FrameFormat,
    noise: Option<&mut NoiseTx>,
) -> Result<RawFrame, CodecError> {
    match noise {
        None => msg.encode(format),
        Some(tx) => {
            let inner = match msg.encode(format)? {
                RawFrame::Binary(bytes) => bytes,
                RawFrame::Text(text) => text.into_bytes(),
            };
            let sealed = tx
                .seal(&inner)
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            Message::Noise(NoisePayload {
                payload_hex: hex::encode(sealed),
            })
            .encode(format)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Ack, NoiseOffer, Publish, Subscribe};
    use crate::noise::ClientNoise;
    use aether_core::crypto::KeyPair;
    use aether_core::EventWire;

    fn hello(formats: &[&str], noise: Option<NoiseOffer>) -> RawFrame {
        Message::Hello(Hello {
            version: PROTOCOL_VERSION,
            formats: formats.iter().map(|s| s.to_string()).collect(),
            noise,
        })
        .encode(FrameFormat::Json)
        .unwrap()
    }

    fn welcome_of(outputs: &[SessionOutput]) -> Welcome {
        outputs
            .iter()
            .find_map(|o| match o {
                SessionOutput::Send(Message::Welcome(w)) => Some(w.clone()),
                _ => None,
            })
            .expect("welcome reply")
    }

    fn negotiated_format(outputs: &[SessionOutput]) -> Option<FrameFormat> {
        outputs.iter().rev().find_map(|o| match o {
            SessionOutput::SetFormat(f) => Some(*f),
            _ => None,
        })
    }

    #[test]
    fn negotiates_binary_over_json() {
        let mut session = Session::new(SessionConfig::default());
        let outputs = session.on_frame(&hello(&["json", "binary"], None));

        assert_eq!(welcome_of(&outputs).format, "binary");
        assert_eq!(negotiated_format(&outputs), Some(FrameFormat::Binary));
        assert_eq!(session.format(), FrameFormat::Binary);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn falls_back_to_json() {
        let mut session = Session::new(SessionConfig::default());
        let outputs = session.on_frame(&hello(&["json"], None));
        assert_eq!(welcome_of(&outputs).format, "json");
    }

    #[test]
    fn rejects_disjoint_formats() {
        let mut session = Session::new(SessionConfig {
            allowed_formats: vec![FrameFormat::Binary],
            ..Default::default()
        });
        let outputs = session.on_frame(&hello(&["json"], None));
        assert!(matches!(outputs.last(), Some(SessionOutput::Close)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn first_frame_must_be_hello() {
        let mut session = Session::new(SessionConfig::default());
        let raw = Message::Unsubscribe(crate::messages::Unsubscribe { sub_id: "s".into() })
            .encode(FrameFormat::Json)
            .unwrap();
        let outputs = session.on_frame(&raw);
        assert!(matches!(outputs.last(), Some(SessionOutput::Close)));
    }

    #[test]
    fn unexpected_types_keep_the_session_active() {
        let mut session = Session::new(SessionConfig::default());
        session.on_frame(&hello(&["json"], None));

        let raw = Message::Ack(Ack {
            event_id: "00".into(),
            accepted: true,
            reason: None,
        })
        .encode(FrameFormat::Json)
        .unwrap();
        let outputs = session.on_frame(&raw);

        assert!(matches!(
            outputs.as_slice(),
            [SessionOutput::Send(Message::Error(_))]
        ));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn malformed_frames_close_the_session() {
        let mut session = Session::new(SessionConfig::default());
        session.on_frame(&hello(&["json"], None));

        let outputs = session.on_frame(&RawFrame::Text("{broken".into()));
        assert!(matches!(outputs.last(), Some(SessionOutput::Close)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn publish_becomes_a_command() {
        let mut session = Session::new(SessionConfig::default());
        session.on_frame(&hello(&["json"], None));

        let event = KeyPair::from_seed(&[1; 32]).sign_event(1, 1, vec![], b"hi".to_vec());
        let raw = Message::Publish(Publish {
            event: EventWire::from_event(&event),
        })
        .encode(FrameFormat::Json)
        .unwrap();

        let outputs = session.on_frame(&raw);
        assert!(matches!(
            outputs.as_slice(),
            [SessionOutput::Command(ClientCommand::Publish(_))]
        ));
    }

    #[test]
    fn noise_upgrade_end_to_end() {
        let client = ClientNoise::new();
        let mut session = Session::new(SessionConfig::default());

        let outputs = session.on_frame(&hello(
            &["binary"],
            Some(NoiseOffer {
                required: true,
                pubkey: Some(hex::encode(client.public_key())),
            }),
        ));

        let welcome = welcome_of(&outputs);
        let noise = welcome.noise.expect("noise accepted");
        assert!(noise.required);
        let mut server_tx = outputs
            .into_iter()
            .find_map(|o| match o {
                SessionOutput::EnableNoise(tx) => Some(tx),
                _ => None,
            })
            .expect("egress key");

        let server_pub: [u8; 32] = hex::decode(noise.pubkey).unwrap().try_into().unwrap();
        let (mut client_tx, mut client_rx) = client.finish(&server_pub).unwrap();

        // Client → server: a sealed subscribe command.
        let inner = Message::Subscribe(Subscribe {
            sub_id: "s1".into(),
            filters: vec![],
        })
        .encode(FrameFormat::Binary)
        .unwrap();
        let RawFrame::Binary(inner_bytes) = inner else {
            panic!("binary format")
        };
        let sealed = client_tx.seal(&inner_bytes).unwrap();
        let raw = Message::Noise(NoisePayload {
            payload_hex: hex::encode(sealed),
        })
        .encode(FrameFormat::Binary)
        .unwrap();

        let outputs = session.on_frame(&raw);
        assert!(matches!(
            outputs.as_slice(),
            [SessionOutput::Command(ClientCommand::Subscribe { .. })]
        ));

        // Server → client: a sealed ack the client can open.
        let ack = Message::Ack(Ack {
            event_id: "00".into(),
            accepted: true,
            reason: None,
        });
        let raw = seal_and_encode(&ack, FrameFormat::Binary, Some(&mut server_tx)).unwrap();
        let Message::Noise(wrapped) = Message::decode(&raw).unwrap() else {
            panic!("expected noise envelope")
        };
        let plaintext = client_rx
            .open(&hex::decode(wrapped.payload_hex).unwrap())
            .unwrap();
        assert_eq!(
            Message::decode(&RawFrame::Binary(plaintext)).unwrap(),
            ack
        );
    }

    #[test]
    fn cleartext_after_upgrade_closes() {
        let client = ClientNoise::new();
        let mut session = Session::new(SessionConfig::default());
        session.on_frame(&hello(
            &["binary"],
            Some(NoiseOffer {
                required: true,
                pubkey: Some(hex::encode(client.public_key())),
            }),
        ));

        let raw = Message::Unsubscribe(crate::messages::Unsubscribe { sub_id: "s".into() })
            .encode(FrameFormat::Binary)
            .unwrap();
        let outputs = session.on_frame(&raw);
        assert!(matches!(outputs.last(), Some(SessionOutput::Close)));
    }

    #[test]
    fn noise_without_pubkey_is_rejected() {
        let mut session = Session::new(SessionConfig::default());
        let outputs = session.on_frame(&hello(
            &["binary"],
            Some(NoiseOffer {
                required: true,
                pubkey: None,
            }),
        ));
        assert!(matches!(outputs.last(), Some(SessionOutput::Close)));
    }
}
