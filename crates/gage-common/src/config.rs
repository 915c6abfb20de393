//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > gage.toml > defaults
//!
//! Every section also implements [`Default`] with the same values as the
//! builder defaults, so library users can construct call components without
//! touching the global.

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call gage_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("signaling.url", "ws://localhost:3000/ws/calls")?
        .set_default("signaling.heartbeat_interval_ms", 30_000)?
        .set_default("signaling.connect_timeout_ms", 20_000)?
        .set_default("signaling.debounce_ms", 5_000)?
        .set_default("signaling.max_reconnect_attempts", 10)?
        .set_default("signaling.reconnect_base_ms", 1_000)?
        .set_default("signaling.reconnect_max_ms", 30_000)?
        .set_default("signaling.jitter_ms", 1_000)?
        .set_default("signaling.reconnect_cap_ms", 45_000)?
        .set_default("signaling.event_buffer", 256)?
        .set_default("health.instability_threshold", 3)?
        .set_default("health.cooldown_step_ms", 5_000)?
        .set_default("health.cooldown_max_ms", 30_000)?
        .set_default("health.stable_period_ms", 60_000)?
        .set_default("health.uptime_smoothing", 0.3)?
        .set_default("sfu.base_url", "http://localhost:3000/api")?
        .set_default("sfu.request_timeout_ms", 10_000)?
        .set_default("call.consume_delay_ms", 1_000)?
        .set_default("call.video_max_bitrate", 1_500_000)?
        .set_default("call.audio_max_bitrate", 64_000)?
        // Optional config file
        .add_source(config::File::with_name("gage").required(false))
        // Environment variables (GAGE__SIGNALING__URL, GAGE__SFU__BASE_URL, etc.)
        .add_source(
            config::Environment::with_prefix("GAGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub health: HealthConfig,
    pub sfu: SfuConfig,
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the call signaling server.
    pub url: String,
    pub heartbeat_interval_ms: u64,
    /// An attempt that has not opened after this long is abandoned.
    pub connect_timeout_ms: u64,
    /// Minimum spacing between externally requested connection attempts.
    pub debounce_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub jitter_ms: u64,
    /// Hard ceiling on any single reconnect delay, cooldown included.
    pub reconnect_cap_ms: u64,
    /// Capacity of the broadcast channel fanning events out to subscribers.
    pub event_buffer: usize,
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/ws/calls".into(),
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 20_000,
            debounce_ms: 5_000,
            max_reconnect_attempts: 10,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            jitter_ms: 1_000,
            reconnect_cap_ms: 45_000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Instability count at which the extra reconnect cooldown kicks in.
    pub instability_threshold: u32,
    pub cooldown_step_ms: u64,
    pub cooldown_max_ms: u64,
    /// Continuous uptime that earns one instability credit back.
    pub stable_period_ms: u64,
    /// Weight of the newest sample in the smoothed uptime (0..=1).
    pub uptime_smoothing: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            instability_threshold: 3,
            cooldown_step_ms: 5_000,
            cooldown_max_ms: 30_000,
            stable_period_ms: 60_000,
            uptime_smoothing: 0.3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SfuConfig {
    /// Base URL of the SFU HTTP control plane (e.g. "https://gage.example.com/api").
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".into(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// Pause before consuming a freshly announced remote producer.
    pub consume_delay_ms: u64,
    /// Bitrate ceiling applied to the first publish attempt of a video track.
    pub video_max_bitrate: u32,
    /// Bitrate ceiling applied to the first publish attempt of an audio track.
    pub audio_max_bitrate: u32,
}

impl CallConfig {
    pub fn consume_delay(&self) -> Duration {
        Duration::from_millis(self.consume_delay_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            consume_delay_ms: 1_000,
            video_max_bitrate: 1_500_000,
            audio_max_bitrate: 64_000,
        }
    }
}
