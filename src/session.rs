//! Session protocol state machine: `Closed → Handshaking → Open → Closed`.
//!
//! Owned and driven by the dispatcher thread. The transport delivers inbound
//! traffic on its own thread through [`TransportEvents`]; the hello response
//! is consumed here, everything else goes to the [`SessionObserver`].

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::audio::AudioFrame;
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{AudioParams, ClientMessage, ListenState, ServerMessage, PROTOCOL_VERSION};
use crate::state_machine::{AbortReason, ListeningMode};

pub const TRANSPORT_KIND: &str = "websocket";

/// One established connection. Sends never block on the network.
pub trait SessionTransport: Send {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn close(&mut self);
}

/// Inbound side of a connection. Called on the transport's reader thread.
pub trait TransportEvents: Send + Sync {
    fn on_text(&self, text: String);
    fn on_binary(&self, data: Bytes);
    /// Must be called when the connection ends, graceful or not.
    fn on_disconnected(&self);
}

pub trait TransportFactory: Send {
    fn connect(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;
}

/// Receives session traffic. Called on the transport's reader thread, so
/// implementations hand work to the dispatcher instead of acting directly.
pub trait SessionObserver: Send + Sync {
    fn on_incoming_json(&self, message: ServerMessage);
    fn on_incoming_audio(&self, frame: AudioFrame);
    /// Fires exactly once per opened connection.
    fn on_audio_channel_closed(&self);
}

/// Audio parameters negotiated by the hello exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandshakeResult {
    pub server_sample_rate: u32,
    pub session_id: String,
}

#[derive(Default)]
struct LinkState {
    handshake: Option<SessionHandshakeResult>,
    disconnected: bool,
}

/// Per-connection glue between the transport and the protocol.
struct SessionLink {
    observer: Arc<dyn SessionObserver>,
    frame_duration_ms: u32,
    state: Mutex<LinkState>,
    hello: Condvar,
    last_incoming: Mutex<Instant>,
    /// Set once the closed callback fired, or when this link was replaced.
    finished: AtomicBool,
}

impl SessionLink {
    fn new(observer: Arc<dyn SessionObserver>, frame_duration_ms: u32) -> Self {
        Self {
            observer,
            frame_duration_ms,
            state: Mutex::new(LinkState::default()),
            hello: Condvar::new(),
            last_incoming: Mutex::new(Instant::now()),
            finished: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        *self.last_incoming.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_incoming
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    fn retire(&self) {
        self.finished.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn fire_closed(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.observer.on_audio_channel_closed();
        }
    }

    fn on_hello(&self, hello: crate::protocol::HelloResponse) {
        if hello.transport != TRANSPORT_KIND {
            log::error!("Unsupported transport: {}", hello.transport);
            return;
        }
        let server_sample_rate = hello
            .audio_params
            .and_then(|params| params.sample_rate)
            .unwrap_or(16000);
        let mut state = self.lock_state();
        state.handshake = Some(SessionHandshakeResult {
            server_sample_rate,
            session_id: hello.session_id.unwrap_or_default(),
        });
        drop(state);
        self.hello.notify_all();
    }
}

impl TransportEvents for SessionLink {
    fn on_text(&self, text: String) {
        if self.is_retired() {
            return;
        }
        self.touch();
        match ServerMessage::parse(&text) {
            Ok(ServerMessage::Hello(hello)) => self.on_hello(hello),
            Ok(ServerMessage::Unknown) => log::debug!("Ignoring message: {}", text),
            Ok(message) => self.observer.on_incoming_json(message),
            Err(e) => log::error!("{}: {}", e, text),
        }
    }

    fn on_binary(&self, data: Bytes) {
        if self.is_retired() {
            return;
        }
        self.touch();
        self.observer
            .on_incoming_audio(AudioFrame::new(data, self.frame_duration_ms));
    }

    fn on_disconnected(&self) {
        log::info!("Websocket disconnected");
        self.lock_state().disconnected = true;
        self.hello.notify_all();
        self.fire_closed();
    }
}

pub struct Protocol {
    config: ProtocolConfig,
    factory: Box<dyn TransportFactory>,
    observer: Arc<dyn SessionObserver>,
    transport: Option<Box<dyn SessionTransport>>,
    link: Option<Arc<SessionLink>>,
    handshake: Option<SessionHandshakeResult>,
    error_occurred: bool,
}

impl Protocol {
    pub fn new(
        config: ProtocolConfig,
        factory: Box<dyn TransportFactory>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            config,
            factory,
            observer,
            transport: None,
            link: None,
            handshake: None,
            error_occurred: false,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.config.access_token),
            ),
            ("Protocol-Version".to_string(), PROTOCOL_VERSION.to_string()),
            ("Device-Id".to_string(), self.config.device_id.clone()),
            ("Client-Id".to_string(), self.config.client_id.clone()),
        ]
    }

    fn hello_message(&self) -> ClientMessage {
        ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            transport: TRANSPORT_KIND.to_string(),
            audio_params: AudioParams {
                format: self.config.audio_format.clone(),
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                frame_duration: self.config.frame_duration_ms,
            },
        }
    }

    fn discard_session(&mut self) {
        if let Some(link) = self.link.take() {
            link.retire();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.handshake = None;
    }

    /// Connect, send hello, and block up to the handshake timeout for the
    /// server's hello. Runs inside a scheduled task.
    pub fn open_audio_channel(&mut self) -> Result<SessionHandshakeResult, ProtocolError> {
        self.discard_session();
        self.error_occurred = false;

        let link = Arc::new(SessionLink::new(
            self.observer.clone(),
            self.config.frame_duration_ms,
        ));
        let headers = self.headers();
        let url = self.config.url.clone();
        log::info!("Connecting to websocket server: {}", url);

        let mut transport = match self.factory.connect(&url, &headers, link.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Failed to connect to websocket server: {}", e);
                self.error_occurred = true;
                return Err(ProtocolError::ServerNotFound(e.to_string()));
            }
        };

        let hello = self.hello_message().to_json();
        if let Err(e) = transport.send_text(&hello) {
            link.retire();
            transport.close();
            self.error_occurred = true;
            return Err(ProtocolError::ServerNotFound(e.to_string()));
        }

        let deadline = Instant::now() + self.config.handshake_timeout;
        let result = {
            let mut state = link.lock_state();
            loop {
                if let Some(result) = state.handshake.clone() {
                    break Some(result);
                }
                let now = Instant::now();
                if state.disconnected || now >= deadline {
                    break None;
                }
                state = link
                    .hello
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0;
            }
        };

        let Some(result) = result else {
            log::error!("Failed to receive server hello");
            link.retire();
            transport.close();
            self.error_occurred = true;
            return Err(ProtocolError::ServerTimeout);
        };

        log::info!(
            "Session {} opened, server sample rate {}",
            result.session_id,
            result.server_sample_rate
        );
        link.touch();
        self.transport = Some(transport);
        self.link = Some(link);
        self.handshake = Some(result.clone());
        Ok(result)
    }

    /// A channel object exists, whether or not it is still healthy.
    pub fn has_channel(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_audio_channel_opened(&self) -> bool {
        match (&self.transport, &self.link) {
            (Some(transport), Some(link)) => {
                transport.is_connected() && !self.error_occurred && !self.is_timeout(link)
            }
            _ => false,
        }
    }

    fn is_timeout(&self, link: &SessionLink) -> bool {
        let idle = link.idle_for();
        if idle > self.config.idle_timeout {
            log::error!("Channel timeout {} seconds", idle.as_secs());
            return true;
        }
        false
    }

    /// Tear the transport down. The closed callback fires once, whether or
    /// not the transport reports the disconnect itself.
    pub fn close_audio_channel(&mut self) {
        let link = self.link.take();
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.handshake = None;
        if let Some(link) = link {
            link.fire_closed();
        }
    }

    pub fn session_id(&self) -> &str {
        self.handshake
            .as_ref()
            .map(|h| h.session_id.as_str())
            .unwrap_or("")
    }

    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    pub fn send_audio(&mut self, data: Bytes) {
        if !self.is_audio_channel_opened() {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send_binary(data) {
                log::warn!("Failed to send audio: {}", e);
            }
        }
    }

    fn send_message(&mut self, message: ClientMessage) -> Result<(), ProtocolError> {
        if !self.is_audio_channel_opened() {
            return Ok(());
        }
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let text = message.to_json();
        if let Err(e) = transport.send_text(&text) {
            log::error!("Failed to send text: {}", text);
            self.error_occurred = true;
            return Err(ProtocolError::Server(e.to_string()));
        }
        Ok(())
    }

    pub fn send_start_listening(&mut self, mode: ListeningMode) -> Result<(), ProtocolError> {
        let message = ClientMessage::Listen {
            session_id: self.session_id().to_string(),
            state: ListenState::Start,
            mode: Some(mode.as_str()),
            text: None,
        };
        self.send_message(message)
    }

    pub fn send_stop_listening(&mut self) -> Result<(), ProtocolError> {
        let message = ClientMessage::Listen {
            session_id: self.session_id().to_string(),
            state: ListenState::Stop,
            mode: None,
            text: None,
        };
        self.send_message(message)
    }

    pub fn send_wake_word_detected(&mut self, wake_word: &str) -> Result<(), ProtocolError> {
        let message = ClientMessage::Listen {
            session_id: self.session_id().to_string(),
            state: ListenState::Detect,
            mode: None,
            text: Some(wake_word.to_string()),
        };
        self.send_message(message)
    }

    pub fn send_abort_speaking(&mut self, reason: AbortReason) -> Result<(), ProtocolError> {
        let message = ClientMessage::Abort {
            session_id: self.session_id().to_string(),
            reason: match reason {
                AbortReason::WakeWordDetected => Some("wake_word_detected"),
                AbortReason::None => None,
            },
        };
        self.send_message(message)
    }

    pub fn send_iot_descriptors(&mut self, descriptors: &str) -> Result<(), ProtocolError> {
        let Some(descriptors) = parse_iot_json(descriptors) else {
            return Ok(());
        };
        let message = ClientMessage::Iot {
            session_id: self.session_id().to_string(),
            update: true,
            descriptors: Some(descriptors),
            states: None,
        };
        self.send_message(message)
    }

    pub fn send_iot_states(&mut self, states: &str) -> Result<(), ProtocolError> {
        let Some(states) = parse_iot_json(states) else {
            return Ok(());
        };
        let message = ClientMessage::Iot {
            session_id: self.session_id().to_string(),
            update: true,
            descriptors: None,
            states: Some(states),
        };
        self.send_message(message)
    }
}

fn parse_iot_json(text: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("Invalid IoT json: {}", e);
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;

    fn make_protocol(factory: FakeFactory, observer: Arc<RecordingObserver>, handshake_ms: u64) -> Protocol {
        let config = ProtocolConfig {
            handshake_timeout: Duration::from_millis(handshake_ms),
            access_token: "token".into(),
            device_id: "aa:bb".into(),
            client_id: "client".into(),
            ..ProtocolConfig::default()
        };
        Protocol::new(config, Box::new(factory), observer)
    }

    #[test]
    fn handshake_negotiates_sample_rate() {
        let (factory, wire, _) = FakeFactory::answering(24000);
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer, 2000);

        let result = protocol.open_audio_channel().unwrap();
        assert_eq!(result.server_sample_rate, 24000);
        assert_eq!(result.session_id, "session-1");
        assert!(protocol.is_audio_channel_opened());

        let headers = wire.headers.lock().unwrap().clone();
        assert!(headers.contains(&("Authorization".into(), "Bearer token".into())));
        assert!(headers.contains(&("Protocol-Version".into(), "1".into())));
        assert!(headers.contains(&("Device-Id".into(), "aa:bb".into())));
        assert!(headers.contains(&("Client-Id".into(), "client".into())));

        let hello = &wire.messages()[0];
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);
    }

    #[test]
    fn handshake_times_out_without_hello() {
        let (factory, _wire, reply) = FakeFactory::answering(16000);
        *reply.lock().unwrap() = HelloReply::Silent;
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer.clone(), 100);

        let started = Instant::now();
        assert!(matches!(
            protocol.open_audio_channel(),
            Err(ProtocolError::ServerTimeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!protocol.is_audio_channel_opened());
        assert!(!protocol.has_channel());
        // a channel that never opened never reports closing
        assert_eq!(observer.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hello_with_wrong_transport_is_ignored() {
        let (factory, _wire, reply) = FakeFactory::answering(16000);
        *reply.lock().unwrap() = HelloReply::Answer {
            transport: "udp".into(),
            sample_rate: 16000,
        };
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer, 150);
        assert!(matches!(
            protocol.open_audio_channel(),
            Err(ProtocolError::ServerTimeout)
        ));
    }

    #[test]
    fn connect_failure_is_server_not_found() {
        let (factory, _wire, reply) = FakeFactory::answering(16000);
        *reply.lock().unwrap() = HelloReply::Refuse;
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer, 100);
        assert!(matches!(
            protocol.open_audio_channel(),
            Err(ProtocolError::ServerNotFound(_))
        ));
        assert!(protocol.error_occurred());
    }

    #[test]
    fn close_fires_callback_once() {
        let (factory, wire, _) = FakeFactory::answering(16000);
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer.clone(), 2000);
        protocol.open_audio_channel().unwrap();

        protocol.close_audio_channel();
        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
        assert!(!protocol.is_audio_channel_opened());

        // late disconnect from the transport thread is swallowed
        wire.events().on_disconnected();
        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inbound_traffic_is_routed_to_observer() {
        let (factory, wire, _) = FakeFactory::answering(16000);
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer.clone(), 2000);
        protocol.open_audio_channel().unwrap();

        let events = wire.events();
        events.on_text(r#"{"type":"stt","text":"hello"}"#.into());
        events.on_text(r#"{"type":"future_feature"}"#.into());
        events.on_text("{broken".into());
        events.on_binary(Bytes::from_static(&[1, 2, 3]));

        assert_eq!(observer.json.lock().unwrap().len(), 1);
        assert_eq!(observer.audio.lock().unwrap()[0].payload.as_ref(), &[1, 2, 3]);
        assert!(protocol.is_audio_channel_opened());
    }

    #[test]
    fn idle_channel_times_out() {
        let (factory, _wire, _) = FakeFactory::answering(16000);
        let observer = Arc::new(RecordingObserver::default());
        let config = ProtocolConfig {
            idle_timeout: Duration::from_millis(50),
            ..ProtocolConfig::default()
        };
        let mut protocol = Protocol::new(config, Box::new(factory), observer);
        protocol.open_audio_channel().unwrap();
        assert!(protocol.is_audio_channel_opened());

        std::thread::sleep(Duration::from_millis(80));
        assert!(!protocol.is_audio_channel_opened());
        assert!(protocol.has_channel());
    }

    #[test]
    fn sends_are_noops_when_closed_and_failures_flag_error() {
        let (factory, wire, _) = FakeFactory::answering(16000);
        let observer = Arc::new(RecordingObserver::default());
        let mut protocol = make_protocol(factory, observer, 2000);

        protocol.send_start_listening(ListeningMode::AutoStop).unwrap();
        assert!(wire.texts().is_empty());

        protocol.open_audio_channel().unwrap();
        protocol.send_start_listening(ListeningMode::ManualStop).unwrap();
        protocol.send_abort_speaking(AbortReason::WakeWordDetected).unwrap();
        protocol.send_iot_states(r#"[{"name":"lamp"}]"#).unwrap();
        let messages = wire.messages();
        assert_eq!(messages[1]["mode"], "manual");
        assert_eq!(messages[1]["session_id"], "session-1");
        assert_eq!(messages[2]["reason"], "wake_word_detected");
        assert_eq!(messages[3]["states"][0]["name"], "lamp");
        assert_eq!(messages[3]["update"], true);

        wire.fail_sends.store(true, Ordering::SeqCst);
        assert!(matches!(
            protocol.send_stop_listening(),
            Err(ProtocolError::Server(_))
        ));
        assert!(!protocol.is_audio_channel_opened());
    }
}
