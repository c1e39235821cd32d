use crate::board::{AudioCodec, AudioReadySignal};
use crate::config::Config;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// How often the playback side asks for more audio.
const OUTPUT_TICK: Duration = Duration::from_millis(20);
/// Capture packets kept while the dispatcher is busy.
const MAX_PENDING_CAPTURE: usize = 50;

fn pcm_from_le_bytes(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

struct Shared {
    capture: Mutex<VecDeque<Vec<i16>>>,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
}

/// PCM16 little-endian audio exchanged with the sound process over UDP.
pub struct AudioBridge {
    socket: Arc<UdpSocket>,
    runtime: Handle,
    shared: Arc<Shared>,
    playback: mpsc::UnboundedSender<Vec<u8>>,
    input_sample_rate: u32,
    output_sample_rate: u32,
    input_channels: usize,
    input_reference: bool,
    buffer_size: usize,
}

impl AudioBridge {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(format!("{}:{}", config.audio_local_ip, config.audio_local_port))
                .await?,
        );
        let target_addr = format!("{}:{}", config.audio_remote_ip, config.audio_remote_port);

        let (playback, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sender = socket.clone();
        let max_packet = config.audio_buffer_size.max(2);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                // 按缓冲区大小分包发送
                for chunk in data.chunks(max_packet & !1) {
                    if let Err(e) = sender.send_to(chunk, &target_addr).await {
                        log::warn!("Failed to send audio: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            socket,
            runtime: Handle::current(),
            shared: Arc::new(Shared {
                capture: Mutex::new(VecDeque::new()),
                input_enabled: AtomicBool::new(false),
                output_enabled: AtomicBool::new(false),
            }),
            playback,
            input_sample_rate: config.audio_input_sample_rate,
            output_sample_rate: config.audio_output_sample_rate,
            input_channels: config.audio_input_channels as usize,
            input_reference: config.audio_input_reference,
            buffer_size: config.audio_buffer_size,
        })
    }
}

impl AudioCodec for AudioBridge {
    fn input_sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn has_reference(&self) -> bool {
        self.input_reference
    }

    fn read(&mut self, buffer: &mut Vec<i16>) -> bool {
        let mut capture = self.shared.capture.lock().unwrap_or_else(|p| p.into_inner());
        buffer.clear();
        while let Some(packet) = capture.pop_front() {
            buffer.extend_from_slice(&packet);
        }
        !buffer.is_empty()
    }

    fn write(&mut self, samples: &[i16]) {
        if !self.output_enabled() {
            return;
        }
        if self.playback.send(pcm_to_le_bytes(samples)).is_err() {
            log::warn!("Audio sender stopped");
        }
    }

    fn enable_input(&mut self, enable: bool) {
        self.shared.input_enabled.store(enable, Ordering::Release);
        if !enable {
            self.shared
                .capture
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clear();
        }
    }

    fn enable_output(&mut self, enable: bool) {
        self.shared.output_enabled.store(enable, Ordering::Release);
    }

    fn output_enabled(&self) -> bool {
        self.shared.output_enabled.load(Ordering::Acquire)
    }

    fn start(&mut self, ready: AudioReadySignal) {
        self.enable_input(true);

        // 采集：收到声音进程的PCM数据后通知主循环
        let socket = self.socket.clone();
        let shared = self.shared.clone();
        let input_ready = ready.clone();
        let buffer_size = self.buffer_size;
        self.runtime.spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let len = match socket.recv_from(&mut buf).await {
                    Ok((len, _)) => len,
                    Err(e) => {
                        log::error!("AudioBridge receive failed: {}", e);
                        break;
                    }
                };
                // 太短的包不是有效音频
                if len <= 10 || !shared.input_enabled.load(Ordering::Acquire) {
                    continue;
                }
                {
                    let mut capture = shared.capture.lock().unwrap_or_else(|p| p.into_inner());
                    if capture.len() >= MAX_PENDING_CAPTURE {
                        capture.pop_front();
                    }
                    capture.push_back(pcm_from_le_bytes(&buf[..len]));
                }
                input_ready.input_ready();
            }
        });

        // 播放：声音进程自带缓冲，按固定节拍要数据
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(OUTPUT_TICK);
            loop {
                ticker.tick().await;
                if shared.output_enabled.load(Ordering::Acquire) {
                    ready.output_ready();
                }
            }
        });
    }
}
