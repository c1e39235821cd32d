use mac_address::get_mac_address;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use uuid::Uuid;

use xiaozhi_device_core::application::Application;
use xiaozhi_device_core::audio::SoundBank;
use xiaozhi_device_core::audio_bridge::AudioBridge;
use xiaozhi_device_core::board::{Board, SettingsStore};
use xiaozhi_device_core::config::Config;
use xiaozhi_device_core::gui_bridge::GuiBridge;
use xiaozhi_device_core::iot_bridge::IotBridge;
use xiaozhi_device_core::net_link::WebSocketFactory;
use xiaozhi_device_core::ota::firmware::FileSlots;
use xiaozhi_device_core::ota::http::HttpBackend;
use xiaozhi_device_core::ota::{DeviceIdentity, Ota, VersionChecker};
use xiaozhi_device_core::platform::HostPlatform;
use xiaozhi_device_core::settings::JsonFileSettings;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    let settings = Arc::new(JsonFileSettings::open(config.settings_path));

    // 设备id优先用MAC地址
    if config.device_id == "unknown-device" {
        config.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    // 设备端UUID，保存在设置里以保持重启间身份一致
    if config.client_id == "unknown-client" {
        config.client_id = match settings.get_string("board", "uuid") {
            Some(uuid) if !uuid.is_empty() => uuid,
            _ => {
                let uuid = Uuid::new_v4().to_string();
                settings.set_string("board", "uuid", &uuid);
                log::info!("Generated new Client ID: {}", uuid);
                uuid
            }
        };
    }
    log::info!(
        "Device ID: {}, Client ID: {}",
        config.device_id,
        config.client_id
    );

    // 启动各个桥，与外部进程通信
    let gui_bridge = Arc::new(GuiBridge::new(&config).await?);
    let iot_bridge = Arc::new(IotBridge::new(&config).await?);
    let audio_bridge = AudioBridge::new(&config).await?;
    let platform = Arc::new(HostPlatform::new());

    if config.wake_word_enabled {
        log::warn!("Wake word engine is not available on this host, disabled");
    }
    if config.audio_processor_enabled {
        log::warn!("Audio processor is not available on this host, disabled");
    }

    let board = Board {
        codec: Box::new(audio_bridge),
        display: gui_bridge.clone(),
        led: gui_bridge.clone(),
        iot: iot_bridge.clone(),
        platform: platform.clone(),
        wake_word: None,
        audio_processor: None,
    };
    let sounds = SoundBank::load(config.sounds_dir);
    let app = Application::new(config.application_config(), board, sounds)?;

    let factory = WebSocketFactory::new(
        tokio::runtime::Handle::current(),
        config.protocol_config().handshake_timeout,
    );
    let (app_handle, main_loop) = app.spawn(config.protocol_config(), Box::new(factory))?;

    let gui_handle = app_handle.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge.run(gui_handle).await {
            log::error!("GuiBridge error: {}", e);
        }
    });
    let iot_handle = app_handle.clone();
    tokio::spawn(async move {
        if let Err(e) = iot_bridge.run(iot_handle).await {
            log::error!("IotBridge error: {}", e);
        }
    });

    // 版本检查和激活
    let identity = DeviceIdentity {
        device_id: config.device_id.clone(),
        client_id: config.client_id.clone(),
        app_name: config.app_name.to_string(),
        board_type: config.board_type.to_string(),
        board_name: config.board_name.to_string(),
        language: config.language.to_string(),
    };
    let ota = Ota::new(
        config.ota_config(),
        identity,
        Arc::new(HttpBackend::new(HTTP_TIMEOUT)?),
        Box::new(FileSlots::new(config.firmware_dir, config.app_version)?),
        settings.clone(),
        platform.clone(),
    );
    let checker = VersionChecker::new(ota, app_handle.clone(), config.ota_config());
    tokio::spawn(async move {
        let outcome = checker.run().await;
        log::info!("Version check finished: {:?}", outcome);
    });

    log::info!("Xiaozhi Core Started. Version {}", config.app_version);

    let reboot = platform.reboot_requested();
    tokio::select! {
        // 监听 Ctrl+C 信号
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        _ = reboot.notified() => {
            log::info!("Restarting into the new firmware...");
        }
    }

    app_handle.shutdown();
    tokio::task::spawn_blocking(move || main_loop.join())
        .await?
        .map_err(|_| anyhow::anyhow!("main loop panicked"))?;
    Ok(())
}
