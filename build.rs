use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    audio: Audio,
    gui: Bridge,
    iot: Bridge,
    network: Network,
    hello_message: HelloMessage,
    timing: Timing,
    storage: Storage,
    features: Features,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Audio {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
    input_sample_rate: u32,
    output_sample_rate: u32,
    input_channels: u32,
    input_reference: bool,
}

// GUI 和 IoT 桥的配置结构相同
#[derive(Deserialize)]
struct Bridge {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ota_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    language: String,
}

#[derive(Deserialize)]
struct HelloMessage {
    format: String,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
}

#[derive(Deserialize)]
struct Timing {
    speaking_drain_delay_ms: u64,
    output_silence_timeout_secs: u64,
    handshake_timeout_secs: u64,
    session_idle_timeout_secs: u64,
    ota_retry_max: u32,
    ota_retry_delay_secs: u64,
    activation_poll_secs: u64,
}

#[derive(Deserialize)]
struct Storage {
    settings_path: String,
    firmware_dir: String,
    sounds_dir: String,
}

#[derive(Deserialize)]
struct Features {
    wake_word: bool,
    audio_processor: bool,
}

fn emit_bridge(prefix: &str, bridge: &Bridge) {
    println!("cargo:rustc-env={}_LOCAL_PORT={}", prefix, bridge.local_port);
    println!("cargo:rustc-env={}_REMOTE_PORT={}", prefix, bridge.remote_port);
    println!("cargo:rustc-env={}_LOCAL_IP={}", prefix, bridge.local_ip);
    println!("cargo:rustc-env={}_REMOTE_IP={}", prefix, bridge.remote_ip);
    println!("cargo:rustc-env={}_BUFFER_SIZE={}", prefix, bridge.buffer_size);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=BOARD_NAME={}", config.board.name);

    // 音频配置
    let audio = &config.audio;
    println!("cargo:rustc-env=AUDIO_LOCAL_PORT={}", audio.local_port);
    println!("cargo:rustc-env=AUDIO_REMOTE_PORT={}", audio.remote_port);
    println!("cargo:rustc-env=AUDIO_LOCAL_IP={}", audio.local_ip);
    println!("cargo:rustc-env=AUDIO_REMOTE_IP={}", audio.remote_ip);
    println!("cargo:rustc-env=AUDIO_BUFFER_SIZE={}", audio.buffer_size);
    println!("cargo:rustc-env=AUDIO_INPUT_SAMPLE_RATE={}", audio.input_sample_rate);
    println!("cargo:rustc-env=AUDIO_OUTPUT_SAMPLE_RATE={}", audio.output_sample_rate);
    println!("cargo:rustc-env=AUDIO_INPUT_CHANNELS={}", audio.input_channels);
    println!("cargo:rustc-env=AUDIO_INPUT_REFERENCE={}", audio.input_reference);

    // GUI / IoT 配置
    emit_bridge("GUI", &config.gui);
    emit_bridge("IOT", &config.iot);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=OTA_URL={}", config.network.ota_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);
    println!("cargo:rustc-env=LANGUAGE={}", config.network.language);

    // Hello 消息配置
    println!("cargo:rustc-env=HELLO_FORMAT={}", config.hello_message.format);
    println!("cargo:rustc-env=HELLO_SAMPLE_RATE={}", config.hello_message.sample_rate);
    println!("cargo:rustc-env=HELLO_CHANNELS={}", config.hello_message.channels);
    println!("cargo:rustc-env=HELLO_FRAME_DURATION={}", config.hello_message.frame_duration);

    // 时序参数
    let timing = &config.timing;
    println!("cargo:rustc-env=SPEAKING_DRAIN_DELAY_MS={}", timing.speaking_drain_delay_ms);
    println!("cargo:rustc-env=OUTPUT_SILENCE_TIMEOUT_SECS={}", timing.output_silence_timeout_secs);
    println!("cargo:rustc-env=HANDSHAKE_TIMEOUT_SECS={}", timing.handshake_timeout_secs);
    println!("cargo:rustc-env=SESSION_IDLE_TIMEOUT_SECS={}", timing.session_idle_timeout_secs);
    println!("cargo:rustc-env=OTA_RETRY_MAX={}", timing.ota_retry_max);
    println!("cargo:rustc-env=OTA_RETRY_DELAY_SECS={}", timing.ota_retry_delay_secs);
    println!("cargo:rustc-env=ACTIVATION_POLL_SECS={}", timing.activation_poll_secs);

    // 存储路径
    println!("cargo:rustc-env=SETTINGS_PATH={}", config.storage.settings_path);
    println!("cargo:rustc-env=FIRMWARE_DIR={}", config.storage.firmware_dir);
    println!("cargo:rustc-env=SOUNDS_DIR={}", config.storage.sounds_dir);

    // 可选音频处理阶段
    println!("cargo:rustc-env=FEATURE_WAKE_WORD={}", config.features.wake_word);
    println!("cargo:rustc-env=FEATURE_AUDIO_PROCESSOR={}", config.features.audio_processor);
}
