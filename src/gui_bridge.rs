use crate::application::AppHandle;
use crate::board::{Display, Led};
use crate::config::Config;
use crate::state_machine::DeviceState;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Button presses and touch actions reported by the GUI process.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuiCommand {
    ToggleChat,
    StartListening,
    StopListening,
    Abort,
    WakeWord { text: String },
    DismissAlert,
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    outbound: mpsc::UnboundedSender<String>,
    buffer_size: usize,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket = Arc::new(
            UdpSocket::bind(format!("{}:{}", config.gui_local_ip, config.gui_local_port)).await?,
        );
        let target_addr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port);

        // 显示接口是同步调用，消息经通道交给发送任务
        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        let sender = socket.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sender.send_to(msg.as_bytes(), &target_addr).await {
                    log::warn!("Failed to send to GUI: {}", e);
                }
            }
        });

        Ok(Self {
            socket,
            outbound,
            buffer_size: config.gui_buffer_size,
        })
    }

    /// Turn GUI input into application operations until the socket fails.
    pub async fn run(&self, app: AppHandle) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            // 通过UDP socket接收消息
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match serde_json::from_str::<GuiCommand>(msg) {
                Ok(command) => {
                    log::info!("GUI command: {:?}", command);
                    dispatch(&app, command);
                }
                Err(e) => log::debug!("Ignoring GUI message {}: {}", msg, e),
            }
        }
    }

    fn post(&self, msg: serde_json::Value) {
        if self.outbound.send(msg.to_string()).is_err() {
            log::warn!("GUI sender stopped");
        }
    }
}

fn dispatch(app: &AppHandle, command: GuiCommand) {
    match command {
        GuiCommand::ToggleChat => app.toggle_chat_state(),
        GuiCommand::StartListening => app.start_listening(),
        GuiCommand::StopListening => app.stop_listening(),
        GuiCommand::Abort => app.abort_speaking(crate::state_machine::AbortReason::None),
        GuiCommand::WakeWord { text } => app.wake_word_invoke(&text),
        GuiCommand::DismissAlert => app.dismiss_alert(),
    }
}

impl Display for GuiBridge {
    fn set_status(&self, status: &str) {
        self.post(json!({"type": "status", "text": status}));
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.post(json!({"type": "chat", "role": role, "content": content}));
    }

    fn set_emotion(&self, emotion: &str) {
        self.post(json!({"type": "emotion", "emotion": emotion}));
    }

    fn show_notification(&self, text: &str, duration: Duration) {
        self.post(json!({
            "type": "toast",
            "text": text,
            "duration_ms": duration.as_millis() as u64
        }));
    }
}

impl Led for GuiBridge {
    fn on_state_changed(&self, state: DeviceState, voice_detected: bool) {
        self.post(json!({"state": state.code(), "voice_detected": voice_detected}));
    }
}
