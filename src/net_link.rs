//! WebSocket transport for the session protocol.
//!
//! The protocol runs on the dispatcher thread and expects blocking-free
//! sends, so every connection is split into a writer task fed by an
//! unbounded channel and a reader task that reports inbound frames through
//! [`TransportEvents`]. Both tasks live on the tokio runtime.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::error::TransportError;
use crate::session::{SessionTransport, TransportEvents, TransportFactory};

pub struct WebSocketFactory {
    runtime: Handle,
    connect_timeout: Duration,
}

impl WebSocketFactory {
    pub fn new(runtime: Handle, connect_timeout: Duration) -> Self {
        Self {
            runtime,
            connect_timeout,
        }
    }
}

impl TransportFactory for WebSocketFactory {
    fn connect(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let parsed = Url::parse(url).map_err(|e| TransportError::Connect(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::Connect(format!("no host in {}", url)))?;
        let host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        // 根据配置构建WebSocket请求
        let mut request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let timeout = self.connect_timeout;
        let (ws_stream, _) = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, connect_async(request)).await })
            .map_err(|_| TransportError::Connect("connect timed out".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("Connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));

        // 写任务：把协议层发出的消息送到服务器
        let writer_connected = connected.clone();
        self.runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    log::warn!("Websocket send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_connected.store(false, Ordering::Release);
            let _ = write.close().await;
        });

        // 读任务：把服务器消息交给协议层
        let reader_connected = connected.clone();
        self.runtime.spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => events.on_text(text.to_string()),
                    Ok(Message::Binary(data)) => events.on_binary(data),
                    Ok(Message::Close(frame)) => {
                        log::info!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Websocket receive failed: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::Release);
            events.on_disconnected();
        });

        Ok(Box::new(WebSocketTransport { tx, connected }))
    }
}

pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl WebSocketTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(message)
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

impl SessionTransport for WebSocketTransport {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(Message::Text(text.to_string().into()))
    }

    fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.send(Message::Binary(data))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        if self.connected.load(Ordering::Acquire) {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEvents;

    impl TransportEvents for NoEvents {
        fn on_text(&self, _text: String) {}
        fn on_binary(&self, _data: Bytes) {}
        fn on_disconnected(&self) {}
    }

    #[test]
    fn invalid_url_is_a_connect_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut factory = WebSocketFactory::new(runtime.handle().clone(), Duration::from_secs(1));
        let result = factory.connect("not a url", &[], Arc::new(NoEvents));
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        // bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut factory = WebSocketFactory::new(runtime.handle().clone(), Duration::from_secs(2));
        let url = format!("ws://127.0.0.1:{}/", port);
        let result = factory.connect(&url, &[], Arc::new(NoEvents));
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
