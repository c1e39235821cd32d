//! Device core: the state machine and everything that runs on the dispatcher
//! thread.
//!
//! [`Application`] is owned by one thread that loops on
//! [`EventDispatcher::wait`]. Audio hardware, the session transport, the
//! wake-word engine and the version checker never touch it directly; they
//! raise wake reasons or schedule closures through an [`AppHandle`].

use anyhow::Context;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::audio::prompt_sound::parse_p3;
use crate::audio::{
    AudioFrame, CaptureResampler, DecodeQueue, OpusDecoder, OpusEncoder, PromptSound, SoundBank,
    StreamDecoder, ENCODE_SAMPLE_RATE,
};
use crate::background::BackgroundTask;
use crate::board::{
    AudioCodec, AudioProcessor, AudioProcessorSink, AudioReadySignal, Board, Display,
    IotDispatcher, Led, Platform, WakeWordDetector, WakeWordListener,
};
use crate::config::{ApplicationConfig, ProtocolConfig};
use crate::dispatcher::{EventDispatcher, Scheduler, WakeReasons};
use crate::error::ProtocolError;
use crate::protocol::ServerMessage;
use crate::session::{Protocol, SessionHandshakeResult, SessionObserver, TransportFactory};
use crate::state_machine::{AbortReason, DeviceState, ListeningMode, SharedDeviceState};

/// 界面文字
pub mod lang {
    pub const STANDBY: &str = "待命";
    pub const CONNECTING: &str = "连接中...";
    pub const LISTENING: &str = "聆听中...";
    pub const SPEAKING: &str = "说话中...";
    pub const LOADING_PROTOCOL: &str = "登录服务器...";
    pub const ERROR: &str = "错误";
    pub const ACTIVATION: &str = "激活设备";
    pub const OTA_UPGRADE: &str = "OTA 升级";
    pub const UPGRADING: &str = "正在升级系统...";
    pub const UPGRADE_FAILED: &str = "升级失败";
    pub const NEW_VERSION: &str = "新版本 ";
    pub const VERSION: &str = "版本 ";
}

const CLOCK_TICK: Duration = Duration::from_secs(1);
/// Status shows the wall clock every this many ticks while idle.
const CLOCK_DISPLAY_TICKS: u64 = 10;
const NOTIFICATION_DURATION: Duration = Duration::from_secs(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `HH:MM` of a unix timestamp shifted by a timezone offset.
fn format_clock(unix_secs: i64, offset_minutes: i64) -> String {
    let local = unix_secs + offset_minutes * 60;
    let secs_of_day = local.rem_euclid(86_400);
    format!("{:02}:{:02}", secs_of_day / 3600, secs_of_day % 3600 / 60)
}

pub struct Application {
    config: ApplicationConfig,
    dispatcher: EventDispatcher<Application>,
    scheduler: Scheduler<Application>,
    device_state: DeviceState,
    shared_state: SharedDeviceState,
    running: bool,

    codec: Box<dyn AudioCodec>,
    display: Arc<dyn Display>,
    led: Arc<dyn Led>,
    iot: Arc<dyn IotDispatcher>,
    platform: Arc<dyn Platform>,
    wake_word: Option<Box<dyn WakeWordDetector>>,
    audio_processor: Option<Box<dyn AudioProcessor>>,
    sounds: SoundBank,

    protocol: Option<Protocol>,
    background: Option<BackgroundTask>,
    encoder: Arc<Mutex<OpusEncoder>>,
    decoder: Arc<Mutex<Box<dyn StreamDecoder>>>,
    decode_queue: Arc<DecodeQueue>,
    input_resampler: Option<CaptureResampler>,

    aborted: Arc<AtomicBool>,
    /// Bumped whenever queued or in-flight playback becomes stale.
    playback_epoch: Arc<AtomicU64>,
    keep_listening: bool,
    voice_detected: bool,
    last_output_time: Instant,
    last_iot_states: String,
    clock_ticks: u64,
    timezone_offset_minutes: Option<i64>,
    clock_running: Arc<AtomicBool>,
}

impl Application {
    pub fn new(config: ApplicationConfig, board: Board, sounds: SoundBank) -> anyhow::Result<Self> {
        let dispatcher = EventDispatcher::new();
        let scheduler = dispatcher.scheduler();
        let output_rate = board.codec.output_sample_rate();

        let encoder = OpusEncoder::new(ENCODE_SAMPLE_RATE, config.frame_duration_ms)
            .context("Failed to create opus encoder")?;
        // 解码器先按输出采样率建立，握手后再按服务器采样率重建
        let decoder: Box<dyn StreamDecoder> = Box::new(
            OpusDecoder::new(output_rate, output_rate).context("Failed to create opus decoder")?,
        );
        let background =
            BackgroundTask::new("background_task").context("Failed to spawn background task")?;

        Ok(Self {
            config,
            dispatcher,
            scheduler,
            device_state: DeviceState::Unknown,
            shared_state: SharedDeviceState::new(DeviceState::Unknown),
            running: false,
            codec: board.codec,
            display: board.display,
            led: board.led,
            iot: board.iot,
            platform: board.platform,
            wake_word: board.wake_word,
            audio_processor: board.audio_processor,
            sounds,
            protocol: None,
            background: Some(background),
            encoder: Arc::new(Mutex::new(encoder)),
            decoder: Arc::new(Mutex::new(decoder)),
            decode_queue: Arc::new(DecodeQueue::new()),
            input_resampler: None,
            aborted: Arc::new(AtomicBool::new(false)),
            playback_epoch: Arc::new(AtomicU64::new(0)),
            keep_listening: false,
            voice_detected: false,
            last_output_time: Instant::now(),
            last_iot_states: String::new(),
            clock_ticks: 0,
            timezone_offset_minutes: None,
            clock_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> AppHandle {
        AppHandle::new(self.scheduler.clone(), self.shared_state.clone())
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    /// Bring up audio, the session protocol and the optional front ends,
    /// then settle in Idle.
    pub fn start(&mut self, protocol_config: ProtocolConfig, factory: Box<dyn TransportFactory>) {
        self.set_device_state(DeviceState::Starting);

        let input_rate = self.codec.input_sample_rate();
        if input_rate != ENCODE_SAMPLE_RATE {
            match CaptureResampler::new(
                input_rate,
                ENCODE_SAMPLE_RATE,
                self.codec.input_channels() == 2,
            ) {
                Ok(resampler) => self.input_resampler = Some(resampler),
                Err(e) => log::error!("Failed to create input resampler: {}", e),
            }
        }
        self.codec
            .start(AudioReadySignal::new(self.dispatcher.wake_signal()));

        self.display.set_status(lang::LOADING_PROTOCOL);
        let observer = Arc::new(SessionEvents {
            scheduler: self.scheduler.clone(),
            state: self.shared_state.clone(),
            decode_queue: self.decode_queue.clone(),
            platform: self.platform.clone(),
        });
        self.protocol = Some(Protocol::new(protocol_config, factory, observer));

        let channels = self.codec.input_channels();
        let reference = self.codec.has_reference();
        if let Some(processor) = self.audio_processor.as_mut() {
            processor.initialize(
                channels,
                reference,
                Arc::new(ProcessorOutput {
                    scheduler: self.scheduler.clone(),
                }),
            );
        }
        if let Some(wake_word) = self.wake_word.as_mut() {
            wake_word.initialize(
                channels,
                reference,
                Arc::new(WakeWordEvents {
                    scheduler: self.scheduler.clone(),
                }),
            );
            wake_word.start_detection();
        }

        self.set_device_state(DeviceState::Idle);
    }

    /// Main loop. Returns after [`Application::shutdown`] runs.
    pub fn run(&mut self) {
        self.running = true;
        self.start_clock_timer();
        while self.running {
            let reasons = self.dispatcher.wait();
            if reasons.contains(WakeReasons::AUDIO_INPUT_READY) {
                self.input_audio();
            }
            if reasons.contains(WakeReasons::AUDIO_OUTPUT_READY) {
                self.output_audio();
            }
            if reasons.contains(WakeReasons::SCHEDULE) {
                self.run_scheduled_tasks();
            }
        }
        self.clock_running.store(false, Ordering::Release);
        self.dispatcher.close();
        log::info!("Main loop stopped");
    }

    /// Move the application onto its own thread: `start`, then `run`.
    pub fn spawn(
        mut self,
        protocol_config: ProtocolConfig,
        factory: Box<dyn TransportFactory>,
    ) -> std::io::Result<(AppHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let thread = thread::Builder::new()
            .name("main_loop".into())
            .spawn(move || {
                self.start(protocol_config, factory);
                self.run();
            })?;
        Ok((handle, thread))
    }

    pub fn shutdown(&mut self) {
        self.running = false;
    }

    /// Run every task queued so far. Returns how many ran.
    pub fn run_scheduled_tasks(&mut self) -> usize {
        let tasks = self.dispatcher.take_tasks();
        let count = tasks.len();
        for task in tasks {
            task(self);
        }
        count
    }

    fn start_clock_timer(&mut self) {
        if self.clock_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let running = self.clock_running.clone();
        let scheduler = self.scheduler.clone();
        let spawned = thread::Builder::new()
            .name("clock_timer".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::sleep(CLOCK_TICK);
                    scheduler.schedule(|app: &mut Application| app.on_clock_timer());
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to start clock timer: {}", e);
            self.clock_running.store(false, Ordering::Release);
        }
    }

    fn wait_for_background(&self) {
        if let Some(background) = self.background.as_ref() {
            background.wait_for_completion();
        }
    }

    // ======================== State machine ========================

    pub fn set_device_state(&mut self, state: DeviceState) {
        if self.device_state == state {
            return;
        }
        self.clock_ticks = 0;
        let previous = self.device_state;
        self.device_state = state;
        self.shared_state.set(state);
        log::info!("STATE: {}", state);

        // 状态变化后旧状态的编解码任务必须先跑完
        self.wait_for_background();

        self.led.on_state_changed(state, self.voice_detected);
        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                self.display.set_status(lang::STANDBY);
                self.display.set_emotion("neutral");
                if let Some(processor) = self.audio_processor.as_mut() {
                    processor.stop();
                }
            }
            DeviceState::Connecting => {
                self.display.set_status(lang::CONNECTING);
                self.display.set_emotion("neutral");
                self.display.set_chat_message("system", "");
            }
            DeviceState::Listening => {
                self.display.set_status(lang::LISTENING);
                self.display.set_emotion("neutral");
                self.reset_decoder();
                lock(&self.encoder).reset_state();
                if let Some(processor) = self.audio_processor.as_mut() {
                    processor.start();
                }
                self.update_iot_states();
                if previous == DeviceState::Speaking {
                    // 等播放缓冲放空，免得把自己的声音录进去
                    thread::sleep(self.config.speaking_drain_delay);
                }
            }
            DeviceState::Speaking => {
                self.display.set_status(lang::SPEAKING);
                self.reset_decoder();
                self.codec.enable_output(true);
                if let Some(processor) = self.audio_processor.as_mut() {
                    processor.stop();
                }
            }
            _ => {}
        }
    }

    fn reset_decoder(&mut self) {
        lock(&self.decoder).reset();
        self.decode_queue.clear();
        self.playback_epoch.fetch_add(1, Ordering::AcqRel);
        self.last_output_time = Instant::now();
    }

    fn set_decode_sample_rate(&mut self, sample_rate: u32) {
        let mut decoder = lock(&self.decoder);
        if decoder.sample_rate() == sample_rate {
            return;
        }
        if let Err(e) = decoder.set_sample_rate(sample_rate) {
            log::error!("Failed to set decode sample rate {}: {}", sample_rate, e);
        }
    }

    // ======================== Audio paths ========================

    fn input_audio(&mut self) {
        let mut data = Vec::new();
        if !self.codec.read(&mut data) || data.is_empty() {
            return;
        }
        let data = match self.input_resampler.as_mut() {
            Some(resampler) => match resampler.process(&data) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Failed to resample input: {}", e);
                    return;
                }
            },
            None => data,
        };
        // 重采样器攒够一整块才出数据
        if data.is_empty() {
            return;
        }

        if let Some(wake_word) = self.wake_word.as_mut() {
            if wake_word.is_detection_running() {
                wake_word.feed(&data);
            }
        }
        if let Some(processor) = self.audio_processor.as_mut() {
            if processor.is_running() {
                processor.input(&data);
                return;
            }
        }

        if self.device_state == DeviceState::Listening {
            let mono: Vec<i16> = if self.codec.input_channels() == 2 {
                // 没有前端处理时只取麦克风通道
                data.iter().step_by(2).copied().collect()
            } else {
                data
            };
            self.encode_and_send(mono);
        }
    }

    fn encode_and_send(&mut self, pcm: Vec<i16>) {
        let Some(background) = self.background.as_ref() else {
            return;
        };
        let encoder = self.encoder.clone();
        let scheduler = self.scheduler.clone();
        background.schedule(move || {
            let packets = match lock(&encoder).encode(&pcm) {
                Ok(packets) => packets,
                Err(e) => {
                    log::error!("Failed to encode audio: {}", e);
                    return;
                }
            };
            for packet in packets {
                scheduler.schedule(move |app: &mut Application| {
                    if let Some(protocol) = app.protocol.as_mut() {
                        protocol.send_audio(Bytes::from(packet));
                    }
                });
            }
        });
    }

    fn output_audio(&mut self) {
        let now = Instant::now();
        if self.decode_queue.is_empty() {
            // 空闲太久就关掉功放
            if self.device_state == DeviceState::Idle
                && now.duration_since(self.last_output_time) > self.config.output_silence_timeout
                && self.codec.output_enabled()
            {
                self.codec.enable_output(false);
            }
            return;
        }

        if self.device_state == DeviceState::Listening {
            self.decode_queue.clear();
            return;
        }

        self.last_output_time = now;
        let Some(frame) = self.decode_queue.pop() else {
            return;
        };
        let Some(background) = self.background.as_ref() else {
            return;
        };

        let decoder = self.decoder.clone();
        let aborted = self.aborted.clone();
        let scheduler = self.scheduler.clone();
        let epoch = self.playback_epoch.load(Ordering::Acquire);
        background.schedule(move || {
            if aborted.load(Ordering::Acquire) {
                return;
            }
            let pcm = match lock(&decoder).decode(&frame.payload) {
                Ok(pcm) => pcm,
                Err(e) => {
                    log::warn!("Failed to decode audio: {}", e);
                    return;
                }
            };
            if aborted.load(Ordering::Acquire) {
                return;
            }
            scheduler.schedule(move |app: &mut Application| app.write_output(pcm, epoch));
        });
    }

    fn write_output(&mut self, pcm: Vec<i16>, epoch: u64) {
        if self.aborted.load(Ordering::Acquire)
            || epoch != self.playback_epoch.load(Ordering::Acquire)
        {
            log::debug!("Dropping {} stale samples", pcm.len());
            return;
        }
        self.codec.write(&pcm);
    }

    // ======================== Session ========================

    fn send_with<F>(&mut self, send: F)
    where
        F: FnOnce(&mut Protocol) -> Result<(), ProtocolError>,
    {
        let Some(protocol) = self.protocol.as_mut() else {
            return;
        };
        if let Err(e) = send(protocol) {
            self.on_network_error(&e);
        }
    }

    /// Open the session and apply what the handshake negotiated. Failures
    /// are reported through the network-error path.
    fn open_audio_channel(&mut self) -> bool {
        let Some(protocol) = self.protocol.as_mut() else {
            return false;
        };
        match protocol.open_audio_channel() {
            Ok(result) => {
                self.on_audio_channel_opened(result);
                true
            }
            Err(e) => {
                self.on_network_error(&e);
                false
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|protocol| protocol.is_audio_channel_opened())
    }

    fn close_audio_channel(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.close_audio_channel();
        }
    }

    fn on_audio_channel_opened(&mut self, result: SessionHandshakeResult) {
        self.platform.set_power_save_mode(false);
        if result.server_sample_rate != self.codec.output_sample_rate() {
            log::warn!(
                "Server sample rate {} does not match device output sample rate {}, resampling may cause distortion",
                result.server_sample_rate,
                self.codec.output_sample_rate()
            );
        }
        self.set_decode_sample_rate(result.server_sample_rate);

        self.last_iot_states.clear();
        let descriptors = self.iot.descriptors_json();
        self.send_with(|protocol| protocol.send_iot_descriptors(&descriptors));
    }

    fn on_network_error(&mut self, error: &ProtocolError) {
        log::error!("Network error: {}", error);
        self.set_device_state(DeviceState::Idle);
        self.alert(
            lang::ERROR,
            error.user_message(),
            "sad",
            Some(PromptSound::Exclamation),
        );
    }

    fn on_incoming_json(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Tts(tts) => match tts.state.as_str() {
                "start" => {
                    self.aborted.store(false, Ordering::Release);
                    if matches!(
                        self.device_state,
                        DeviceState::Idle | DeviceState::Listening
                    ) {
                        self.set_device_state(DeviceState::Speaking);
                    }
                }
                "stop" => {
                    if self.device_state == DeviceState::Speaking {
                        self.wait_for_background();
                        if self.keep_listening {
                            self.send_with(|protocol| {
                                protocol.send_start_listening(ListeningMode::AutoStop)
                            });
                            self.set_device_state(DeviceState::Listening);
                        } else {
                            self.set_device_state(DeviceState::Idle);
                        }
                    }
                }
                "sentence_start" => {
                    if let Some(text) = tts.text {
                        log::info!("<< {}", text);
                        self.display.set_chat_message("assistant", &text);
                    }
                }
                other => log::debug!("Unhandled tts state: {}", other),
            },
            ServerMessage::Stt { text } => {
                log::info!(">> {}", text);
                self.display.set_chat_message("user", &text);
            }
            ServerMessage::Llm { emotion } => self.display.set_emotion(&emotion),
            ServerMessage::Iot { commands } => {
                for command in &commands {
                    self.iot.invoke(command);
                }
            }
            ServerMessage::Hello(_) | ServerMessage::Unknown => {}
        }
    }

    fn on_audio_channel_closed(&mut self) {
        self.reset_decoder();
        self.display.set_chat_message("system", "");
        self.set_device_state(DeviceState::Idle);
    }

    /// Push IoT states to the server, skipping unchanged snapshots.
    pub fn update_iot_states(&mut self) {
        let states = self.iot.states_json();
        if states == self.last_iot_states {
            return;
        }
        self.last_iot_states = states.clone();
        self.send_with(|protocol| protocol.send_iot_states(&states));
    }

    // ======================== User operations ========================

    pub fn toggle_chat_state(&mut self) {
        if self.device_state == DeviceState::Activating {
            self.set_device_state(DeviceState::Idle);
            return;
        }
        if self.protocol.is_none() {
            log::error!("Protocol not initialized");
            return;
        }

        match self.device_state {
            DeviceState::Idle => self.scheduler.schedule(|app: &mut Application| {
                app.set_device_state(DeviceState::Connecting);
                if !app.open_audio_channel() {
                    return;
                }
                app.keep_listening = true;
                app.send_with(|protocol| protocol.send_start_listening(ListeningMode::AutoStop));
                app.set_device_state(DeviceState::Listening);
            }),
            DeviceState::Speaking => self.scheduler.schedule(|app: &mut Application| {
                app.abort_speaking(AbortReason::None);
            }),
            DeviceState::Listening => self.scheduler.schedule(|app: &mut Application| {
                app.close_audio_channel();
            }),
            _ => {}
        }
    }

    /// Push-to-talk press.
    pub fn start_listening(&mut self) {
        if self.device_state == DeviceState::Activating {
            self.set_device_state(DeviceState::Idle);
            return;
        }
        if self.protocol.is_none() {
            log::error!("Protocol not initialized");
            return;
        }

        self.keep_listening = false;
        match self.device_state {
            DeviceState::Idle => self.scheduler.schedule(|app: &mut Application| {
                if !app.is_audio_channel_opened() {
                    app.set_device_state(DeviceState::Connecting);
                    if !app.open_audio_channel() {
                        return;
                    }
                }
                app.send_with(|protocol| protocol.send_start_listening(ListeningMode::ManualStop));
                app.set_device_state(DeviceState::Listening);
            }),
            DeviceState::Speaking => self.scheduler.schedule(|app: &mut Application| {
                app.abort_speaking(AbortReason::None);
                app.send_with(|protocol| protocol.send_start_listening(ListeningMode::ManualStop));
                app.set_device_state(DeviceState::Listening);
            }),
            _ => {}
        }
    }

    /// Push-to-talk release.
    pub fn stop_listening(&mut self) {
        self.scheduler.schedule(|app: &mut Application| {
            if app.device_state == DeviceState::Listening {
                app.send_with(|protocol| protocol.send_stop_listening());
                app.set_device_state(DeviceState::Idle);
            }
        });
    }

    /// Wake word triggered from outside the detector (e.g. a button).
    pub fn wake_word_invoke(&mut self, wake_word: &str) {
        match self.device_state {
            DeviceState::Idle => {
                self.toggle_chat_state();
                let wake_word = wake_word.to_string();
                self.scheduler.schedule(move |app: &mut Application| {
                    app.send_with(|protocol| protocol.send_wake_word_detected(&wake_word));
                });
            }
            DeviceState::Speaking => self.scheduler.schedule(|app: &mut Application| {
                app.abort_speaking(AbortReason::None);
            }),
            DeviceState::Listening => self.scheduler.schedule(|app: &mut Application| {
                app.close_audio_channel();
            }),
            _ => {}
        }
    }

    pub fn abort_speaking(&mut self, reason: AbortReason) {
        log::info!("Abort speaking");
        self.aborted.store(true, Ordering::Release);
        self.playback_epoch.fetch_add(1, Ordering::AcqRel);
        self.send_with(|protocol| protocol.send_abort_speaking(reason));
    }

    pub fn can_enter_sleep_mode(&self) -> bool {
        self.device_state == DeviceState::Idle && !self.is_audio_channel_opened()
    }

    // ======================== Display and sounds ========================

    pub fn alert(&mut self, status: &str, message: &str, emotion: &str, sound: Option<PromptSound>) {
        log::warn!("Alert {}: {} [{}]", status, message, emotion);
        self.display.set_status(status);
        self.display.set_emotion(emotion);
        self.display.set_chat_message("system", message);
        if let Some(sound) = sound {
            self.play_sound(sound);
        }
    }

    pub fn dismiss_alert(&mut self) {
        if self.device_state == DeviceState::Idle {
            self.display.set_status(lang::STANDBY);
            self.display.set_emotion("neutral");
            self.display.set_chat_message("system", "");
        }
    }

    /// Queue a prompt sound for playback. Empty sounds are skipped.
    pub fn play_sound(&mut self, sound: PromptSound) {
        let data = self.sounds.get(sound);
        if data.is_empty() {
            return;
        }
        self.codec.enable_output(true);
        self.set_decode_sample_rate(ENCODE_SAMPLE_RATE);
        match parse_p3(&data) {
            Ok(frames) => self.decode_queue.extend(frames),
            Err(e) => log::error!("Invalid prompt sound {:?}: {}", sound, e),
        }
    }

    /// Read an activation code out loud, one digit sound per character.
    pub fn play_activation_digits(&mut self, code: &str) {
        self.wait_for_background();
        for digit in code.chars().filter_map(|c| c.to_digit(10)) {
            self.play_sound(PromptSound::Digit(digit as u8));
        }
    }

    pub fn show_notification(&self, text: &str) {
        self.display.show_notification(text, NOTIFICATION_DURATION);
    }

    pub fn set_timezone_offset(&mut self, offset_minutes: Option<i64>) {
        self.timezone_offset_minutes = offset_minutes;
    }

    fn on_clock_timer(&mut self) {
        self.clock_ticks += 1;

        // 服务器很久没有消息就关掉通道
        if self.protocol.as_ref().is_some_and(|p| p.has_channel()) && !self.is_audio_channel_opened()
        {
            log::info!("Audio channel is no longer alive, closing");
            self.close_audio_channel();
        }

        if self.clock_ticks % CLOCK_DISPLAY_TICKS == 0 && self.device_state == DeviceState::Idle {
            if let Some(offset) = self.timezone_offset_minutes {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                self.display.set_status(&format_clock(now, offset));
            }
        }
    }

    // ======================== Version check hooks ========================

    /// Stop everything that could touch flash or the audio path before a
    /// firmware download.
    pub fn prepare_upgrade(&mut self, version: &str) {
        self.set_device_state(DeviceState::Upgrading);
        self.display
            .set_chat_message("system", &format!("{}{}", lang::NEW_VERSION, version));
        self.platform.set_power_save_mode(false);
        if let Some(wake_word) = self.wake_word.as_mut() {
            wake_word.stop_detection();
        }
        self.codec.enable_input(false);
        self.codec.enable_output(false);
        self.decode_queue.clear();
        if let Some(mut background) = self.background.take() {
            background.shutdown();
        }
    }

    pub fn show_upgrade_progress(&mut self, percent: u32, speed: usize) {
        let message = format!("{}% {}KB/s", percent, speed / 1024);
        self.display.set_chat_message("system", &message);
    }

    pub fn upgrade_failed(&mut self) {
        self.display.set_status(lang::UPGRADE_FAILED);
    }

    /// The version check is done and the firmware is current.
    pub fn finish_version_check(&mut self, version: &str) {
        self.show_notification(&format!("{}{}", lang::VERSION, version));
        self.set_device_state(DeviceState::Idle);
        self.display.set_chat_message("system", "");
        self.play_sound(PromptSound::Success);
    }

    pub fn reboot(&mut self) {
        log::info!("Rebooting...");
        self.platform.reboot();
    }

    // ======================== Front-end events ========================

    fn on_vad_state_change(&mut self, speaking: bool) {
        if self.device_state == DeviceState::Listening {
            self.voice_detected = speaking;
            self.led.on_state_changed(self.device_state, speaking);
        }
    }

    fn on_wake_word_detected(&mut self, wake_word: String) {
        match self.device_state {
            DeviceState::Idle => {
                self.set_device_state(DeviceState::Connecting);
                if let Some(detector) = self.wake_word.as_mut() {
                    detector.encode_wake_word_data();
                }
                if !self.open_audio_channel() {
                    if let Some(detector) = self.wake_word.as_mut() {
                        detector.start_detection();
                    }
                    return;
                }

                // 先把唤醒词音频发给服务器做声纹识别
                while let Some(opus) = self
                    .wake_word
                    .as_mut()
                    .and_then(|detector| detector.take_wake_word_opus())
                {
                    if let Some(protocol) = self.protocol.as_mut() {
                        protocol.send_audio(Bytes::from(opus));
                    }
                }
                self.send_with(|protocol| protocol.send_wake_word_detected(&wake_word));
                log::info!("Wake word detected: {}", wake_word);
                self.keep_listening = true;
                self.set_device_state(DeviceState::Listening);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            DeviceState::Activating => self.set_device_state(DeviceState::Idle),
            _ => {}
        }

        if let Some(detector) = self.wake_word.as_mut() {
            detector.start_detection();
        }
    }
}

/// Session callbacks, translated into dispatcher work.
struct SessionEvents {
    scheduler: Scheduler<Application>,
    state: SharedDeviceState,
    decode_queue: Arc<DecodeQueue>,
    platform: Arc<dyn Platform>,
}

impl SessionObserver for SessionEvents {
    fn on_incoming_json(&self, message: ServerMessage) {
        self.scheduler
            .schedule(move |app: &mut Application| app.on_incoming_json(message));
    }

    fn on_incoming_audio(&self, frame: AudioFrame) {
        if self.state.get() == DeviceState::Speaking {
            self.decode_queue.push(frame);
        }
    }

    fn on_audio_channel_closed(&self) {
        self.platform.set_power_save_mode(true);
        self.scheduler
            .schedule(|app: &mut Application| app.on_audio_channel_closed());
    }
}

struct ProcessorOutput {
    scheduler: Scheduler<Application>,
}

impl AudioProcessorSink for ProcessorOutput {
    fn on_output(&self, pcm: Vec<i16>) {
        self.scheduler
            .schedule(move |app: &mut Application| app.encode_and_send(pcm));
    }
}

struct WakeWordEvents {
    scheduler: Scheduler<Application>,
}

impl WakeWordListener for WakeWordEvents {
    fn on_vad_state_change(&self, speaking: bool) {
        self.scheduler
            .schedule(move |app: &mut Application| app.on_vad_state_change(speaking));
    }

    fn on_wake_word_detected(&self, wake_word: String) {
        self.scheduler
            .schedule(move |app: &mut Application| app.on_wake_word_detected(wake_word));
    }
}

/// Cloneable entry point into the application from other threads.
#[derive(Clone)]
pub struct AppHandle {
    scheduler: Scheduler<Application>,
    state: SharedDeviceState,
}

impl AppHandle {
    pub(crate) fn new(scheduler: Scheduler<Application>, state: SharedDeviceState) -> Self {
        Self { scheduler, state }
    }

    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Application) + Send + 'static,
    {
        self.scheduler.schedule(task);
    }

    /// Run `task` on the dispatcher thread and wait for its result. `None`
    /// when the main loop is gone.
    pub async fn call<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Application) -> R + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.scheduler.schedule(move |app: &mut Application| {
            let _ = tx.send(task(app));
        });
        rx.await.ok()
    }

    pub fn device_state(&self) -> DeviceState {
        self.state.get()
    }

    pub fn toggle_chat_state(&self) {
        self.schedule(|app| app.toggle_chat_state());
    }

    pub fn start_listening(&self) {
        self.schedule(|app| app.start_listening());
    }

    pub fn stop_listening(&self) {
        self.schedule(|app| app.stop_listening());
    }

    pub fn wake_word_invoke(&self, wake_word: &str) {
        let wake_word = wake_word.to_string();
        self.schedule(move |app| app.wake_word_invoke(&wake_word));
    }

    pub fn abort_speaking(&self, reason: AbortReason) {
        self.schedule(move |app| app.abort_speaking(reason));
    }

    pub fn dismiss_alert(&self) {
        self.schedule(|app| app.dismiss_alert());
    }

    pub fn update_iot_states(&self) {
        self.schedule(|app| app.update_iot_states());
    }

    pub fn shutdown(&self) {
        self.schedule(|app| app.shutdown());
    }
}
