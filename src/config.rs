use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // 应用和板子信息
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub board_type: &'static str,
    pub board_name: &'static str,

    // 声音进程配置
    pub audio_local_port: u16,
    pub audio_remote_port: u16,
    pub audio_local_ip: &'static str,
    pub audio_remote_ip: &'static str,
    pub audio_buffer_size: usize,
    pub audio_input_sample_rate: u32,
    pub audio_output_sample_rate: u32,
    pub audio_input_channels: u32,
    pub audio_input_reference: bool,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: &'static str,
    pub gui_remote_ip: &'static str,
    pub gui_buffer_size: usize,

    // IoT进程配置
    pub iot_local_port: u16,
    pub iot_remote_port: u16,
    pub iot_local_ip: &'static str,
    pub iot_remote_ip: &'static str,
    pub iot_buffer_size: usize,

    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub ota_url: &'static str,
    pub ws_token: &'static str,
    pub language: &'static str,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    // Hello消息参数
    pub hello_format: &'static str,
    pub hello_sample_rate: u32,
    pub hello_channels: u8,
    pub hello_frame_duration: u32,

    // 时序参数
    pub speaking_drain_delay_ms: u64,
    pub output_silence_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub ota_retry_max: u32,
    pub ota_retry_delay_secs: u64,
    pub activation_poll_secs: u64,

    // 存储
    pub settings_path: &'static str,
    pub firmware_dir: &'static str,
    pub sounds_dir: &'static str,

    // 可选音频处理阶段
    pub wake_word_enabled: bool,
    pub audio_processor_enabled: bool,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            board_type: env!("BOARD_TYPE"),
            board_name: env!("BOARD_NAME"),

            audio_local_port: env!("AUDIO_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse AUDIO_LOCAL_PORT")?,
            audio_remote_port: env!("AUDIO_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse AUDIO_REMOTE_PORT")?,
            audio_local_ip: env!("AUDIO_LOCAL_IP"),
            audio_remote_ip: env!("AUDIO_REMOTE_IP"),
            audio_buffer_size: env!("AUDIO_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse AUDIO_BUFFER_SIZE")?,
            audio_input_sample_rate: env!("AUDIO_INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_SAMPLE_RATE")?,
            audio_output_sample_rate: env!("AUDIO_OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_OUTPUT_SAMPLE_RATE")?,
            audio_input_channels: env!("AUDIO_INPUT_CHANNELS").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_CHANNELS")?,
            audio_input_reference: env!("AUDIO_INPUT_REFERENCE").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_REFERENCE")?,

            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP"),
            gui_remote_ip: env!("GUI_REMOTE_IP"),
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,

            iot_local_port: env!("IOT_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse IOT_LOCAL_PORT")?,
            iot_remote_port: env!("IOT_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse IOT_REMOTE_PORT")?,
            iot_local_ip: env!("IOT_LOCAL_IP"),
            iot_remote_ip: env!("IOT_REMOTE_IP"),
            iot_buffer_size: env!("IOT_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse IOT_BUFFER_SIZE")?,

            ws_url: env!("WS_URL"),
            ota_url: env!("OTA_URL"),
            ws_token: env!("WS_TOKEN"),
            language: env!("LANGUAGE"),

            // 设备标识初始化为config.toml中的值
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            hello_format: env!("HELLO_FORMAT"),
            hello_sample_rate: env!("HELLO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse HELLO_SAMPLE_RATE")?,
            hello_channels: env!("HELLO_CHANNELS").parse()
                .map_err(|_| "Failed to parse HELLO_CHANNELS")?,
            hello_frame_duration: env!("HELLO_FRAME_DURATION").parse()
                .map_err(|_| "Failed to parse HELLO_FRAME_DURATION")?,

            speaking_drain_delay_ms: env!("SPEAKING_DRAIN_DELAY_MS").parse()
                .map_err(|_| "Failed to parse SPEAKING_DRAIN_DELAY_MS")?,
            output_silence_timeout_secs: env!("OUTPUT_SILENCE_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse OUTPUT_SILENCE_TIMEOUT_SECS")?,
            handshake_timeout_secs: env!("HANDSHAKE_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse HANDSHAKE_TIMEOUT_SECS")?,
            session_idle_timeout_secs: env!("SESSION_IDLE_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse SESSION_IDLE_TIMEOUT_SECS")?,
            ota_retry_max: env!("OTA_RETRY_MAX").parse()
                .map_err(|_| "Failed to parse OTA_RETRY_MAX")?,
            ota_retry_delay_secs: env!("OTA_RETRY_DELAY_SECS").parse()
                .map_err(|_| "Failed to parse OTA_RETRY_DELAY_SECS")?,
            activation_poll_secs: env!("ACTIVATION_POLL_SECS").parse()
                .map_err(|_| "Failed to parse ACTIVATION_POLL_SECS")?,

            settings_path: env!("SETTINGS_PATH"),
            firmware_dir: env!("FIRMWARE_DIR"),
            sounds_dir: env!("SOUNDS_DIR"),

            wake_word_enabled: env!("FEATURE_WAKE_WORD").parse()
                .map_err(|_| "Failed to parse FEATURE_WAKE_WORD")?,
            audio_processor_enabled: env!("FEATURE_AUDIO_PROCESSOR").parse()
                .map_err(|_| "Failed to parse FEATURE_AUDIO_PROCESSOR")?,
        })
    }

    /// 应用核心（状态机 + 音频管线）使用的参数
    pub fn application_config(&self) -> ApplicationConfig {
        ApplicationConfig {
            frame_duration_ms: self.hello_frame_duration,
            speaking_drain_delay: Duration::from_millis(self.speaking_drain_delay_ms),
            output_silence_timeout: Duration::from_secs(self.output_silence_timeout_secs),
        }
    }

    /// 会话协议使用的参数
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            url: self.ws_url.to_string(),
            access_token: self.ws_token.to_string(),
            device_id: self.device_id.clone(),
            client_id: self.client_id.clone(),
            audio_format: self.hello_format.to_string(),
            sample_rate: self.hello_sample_rate,
            channels: self.hello_channels,
            frame_duration_ms: self.hello_frame_duration,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
        }
    }

    /// 版本检查 / OTA 使用的参数
    pub fn ota_config(&self) -> OtaConfig {
        OtaConfig {
            check_version_url: self.ota_url.to_string(),
            retry_max: self.ota_retry_max,
            retry_delay: Duration::from_secs(self.ota_retry_delay_secs),
            activation_window: Duration::from_secs(self.activation_poll_secs),
            idle_poll_interval: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
            reboot_delay: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

/// Timing and framing knobs for the device state machine.
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub frame_duration_ms: u32,
    /// Pause before capture resumes after speaking, lets the playback buffer empty.
    pub speaking_drain_delay: Duration,
    /// Output is powered down after this long idle with nothing to play.
    pub output_silence_timeout: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: 60,
            speaking_drain_delay: Duration::from_millis(120),
            output_silence_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub url: String,
    pub access_token: String,
    pub device_id: String,
    pub client_id: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration_ms: u32,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/xiaozhi/v1/".to_string(),
            access_token: String::new(),
            device_id: "unknown-device".to_string(),
            client_id: "unknown-client".to_string(),
            audio_format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 60,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtaConfig {
    pub check_version_url: String,
    pub retry_max: u32,
    pub retry_delay: Duration,
    pub activation_window: Duration,
    /// How often the checker looks for the device to become idle before upgrading.
    pub idle_poll_interval: Duration,
    /// Pause after the activation alert and after audio teardown.
    pub settle_delay: Duration,
    pub reboot_delay: Duration,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            check_version_url: String::new(),
            retry_max: 10,
            retry_delay: Duration::from_secs(60),
            activation_window: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
            reboot_delay: Duration::from_secs(3),
        }
    }
}
