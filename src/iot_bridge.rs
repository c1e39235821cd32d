use crate::application::AppHandle;
use crate::board::IotDispatcher;
use crate::config::Config;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// What the IoT process reports about its things.
#[derive(Debug, Deserialize)]
struct IotReport {
    #[serde(default)]
    descriptors: Option<Value>,
    #[serde(default)]
    states: Option<Value>,
}

#[derive(Default)]
struct ThingCache {
    descriptors: String,
    states: String,
}

pub struct IotBridge {
    socket: Arc<UdpSocket>,
    outbound: mpsc::UnboundedSender<String>,
    cache: Mutex<ThingCache>,
    buffer_size: usize,
}

impl IotBridge {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(format!("{}:{}", config.iot_local_ip, config.iot_local_port)).await?,
        );
        let target_addr = format!("{}:{}", config.iot_remote_ip, config.iot_remote_port);

        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        let sender = socket.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sender.send_to(msg.as_bytes(), &target_addr).await {
                    log::warn!("Failed to send to IoT: {}", e);
                }
            }
        });

        Ok(Self {
            socket,
            outbound,
            cache: Mutex::new(ThingCache {
                descriptors: "[]".to_string(),
                states: "[]".to_string(),
            }),
            buffer_size: config.iot_buffer_size,
        })
    }

    /// Cache what the IoT process reports. State changes are pushed to the
    /// server through the application.
    pub async fn run(&self, app: AppHandle) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            if self.apply_report(msg) {
                app.update_iot_states();
            }
        }
    }

    /// Returns true when the states changed.
    fn apply_report(&self, msg: &str) -> bool {
        let report = match serde_json::from_str::<IotReport>(msg) {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Invalid IoT report {}: {}", msg, e);
                return false;
            }
        };
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(descriptors) = report.descriptors {
            cache.descriptors = descriptors.to_string();
        }
        match report.states {
            Some(states) => {
                let states = states.to_string();
                let changed = states != cache.states;
                cache.states = states;
                changed
            }
            None => false,
        }
    }
}

impl IotDispatcher for IotBridge {
    fn descriptors_json(&self) -> String {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .descriptors
            .clone()
    }

    fn states_json(&self) -> String {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .states
            .clone()
    }

    fn invoke(&self, command: &Value) {
        log::info!("Processing IoT Command: {}", command);
        let msg = json!({"type": "iot", "commands": [command]}).to_string();
        if self.outbound.send(msg).is_err() {
            log::warn!("IoT sender stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bridge(remote_port: u16) -> IotBridge {
        let config = Config {
            iot_local_ip: "127.0.0.1",
            iot_local_port: 0,
            iot_remote_ip: "127.0.0.1",
            iot_remote_port: remote_port,
            ..Config::default()
        };
        IotBridge::new(&config).await.unwrap()
    }

    #[tokio::test]
    async fn reports_update_cache() {
        let bridge = bridge(9).await;
        assert_eq!(bridge.states_json(), "[]");

        assert!(!bridge.apply_report(r#"{"descriptors":[{"name":"Lamp"}]}"#));
        assert_eq!(bridge.descriptors_json(), r#"[{"name":"Lamp"}]"#);

        let states = r#"{"states":[{"name":"Lamp","state":{"power":true}}]}"#;
        assert!(bridge.apply_report(states));
        assert!(!bridge.apply_report(states));
        assert!(!bridge.apply_report("not json"));
    }

    #[tokio::test]
    async fn commands_are_forwarded() {
        let iot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bridge = bridge(iot.local_addr().unwrap().port()).await;
        bridge.invoke(&json!({"name": "Lamp", "method": "TurnOn"}));

        let mut buf = [0u8; 512];
        let (len, _) = iot.recv_from(&mut buf).await.unwrap();
        let msg: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(msg["commands"][0]["method"], "TurnOn");
    }
}
