use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::{AlsaBackendConfig, AmplitudeParams};

/// Environment variables override the file, e.g.
/// `TALKBACK__NETWORK__WS_URL=ws://host/ws`.
pub const ENV_PREFIX: &str = "TALKBACK";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub gui: GuiConfig,
    pub audio: AudioConfig,
    pub amplitude: AmplitudeConfig,
    pub ui: UiConfig,
}

// 网络配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ws_url: String,
    pub ws_token: String,
    /// Blank means "generate one at startup".
    pub client_id: String,
    /// Send a `hello` right after every connect. Off by default: stock
    /// servers answer it with an "unknown type" error.
    pub send_hello: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws".to_string(),
            ws_token: String::new(),
            client_id: String::new(),
            send_hello: false,
        }
    }
}

// GUI进程配置, GUI进程和Core进程通过本地UDP通信
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GuiConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_ip: String,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            local_port: 5679,
            remote_port: 5678,
            remote_ip: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA playback device name (e.g. "default", "plughw:0,0")
    pub playback_device: String,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub period_size: usize,
    /// Rate progressive sinks and clips are played at
    pub element_sample_rate: u32,
    /// PCM format used when `audio_begin` leaves it out
    pub default_sample_rate: u32,
    pub default_channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            playback_device: "default".to_string(),
            period_size: 1024,
            element_sample_rate: 48000,
            default_sample_rate: 24000,
            default_channels: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AmplitudeConfig {
    pub noise_floor: f32,
    pub max_level: f32,
    pub window: usize,
    pub tick_hz: u32,
}

impl Default for AmplitudeConfig {
    fn default() -> Self {
        let params = AmplitudeParams::default();
        Self {
            noise_floor: params.noise_floor,
            max_level: params.max_level,
            window: params.window,
            tick_hz: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub trace_limit: usize,
    pub transcript_limit: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            trace_limit: 100,
            transcript_limit: 200,
        }
    }
}

impl Config {
    /// Load `path` (skipped when missing) layered under `TALKBACK__*`
    /// environment variables.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            log::info!("config file {} not found, using defaults", path.display());
            builder
        };

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read config from {}", path.display()))?
            .try_deserialize()
            .context("invalid configuration")?;

        config.finish()
    }

    /// Parse a TOML document on its own, without the environment layer.
    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        config.finish()
    }

    fn finish(mut self) -> anyhow::Result<Self> {
        if self.network.client_id.trim().is_empty() {
            self.network.client_id = Uuid::new_v4().to_string();
            log::info!("Generated new Client ID: {}", self.network.client_id);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.amplitude.max_level <= self.amplitude.noise_floor {
            bail!(
                "amplitude.max_level ({}) must exceed amplitude.noise_floor ({})",
                self.amplitude.max_level,
                self.amplitude.noise_floor
            );
        }
        if self.amplitude.tick_hz == 0 || self.amplitude.window == 0 {
            bail!("amplitude.tick_hz and amplitude.window must be positive");
        }
        if self.audio.default_sample_rate == 0 || self.audio.default_channels == 0 {
            bail!("audio.default_sample_rate and audio.default_channels must be positive");
        }
        url::Url::parse(&self.network.ws_url)
            .with_context(|| format!("network.ws_url is not a valid URL: {}", self.network.ws_url))?;
        Ok(())
    }

    pub fn amplitude_params(&self) -> AmplitudeParams {
        AmplitudeParams {
            noise_floor: self.amplitude.noise_floor,
            max_level: self.amplitude.max_level,
            window: self.amplitude.window,
        }
    }

    pub fn backend_config(&self) -> AlsaBackendConfig {
        AlsaBackendConfig {
            device: self.audio.playback_device.clone(),
            period_size: self.audio.period_size,
            element_sample_rate: self.audio.element_sample_rate,
            tap_window: self.amplitude.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.gui, GuiConfig::default());
        assert_eq!(config.audio.default_sample_rate, 24000);
        assert_eq!(config.ui.trace_limit, 100);
        assert!(Uuid::parse_str(&config.network.client_id).is_ok());
        assert!(!config.network.send_hello);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [network]
            ws_url = "wss://example.org/ws"
            client_id = "kitchen"
            send_hello = true

            [audio]
            playback_device = "plughw:1,0"
            default_channels = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.network.client_id, "kitchen");
        assert!(config.network.send_hello);
        assert_eq!(config.audio.playback_device, "plughw:1,0");
        assert_eq!(config.audio.default_channels, 2);
        assert_eq!(config.audio.period_size, 1024);
    }

    #[test]
    fn test_inverted_amplitude_range_rejected() {
        let result = Config::from_toml_str(
            r#"
            [amplitude]
            noise_floor = 0.5
            max_level = 0.1
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_url_rejected() {
        assert!(Config::from_toml_str("[network]\nws_url = \"not a url\"").is_err());
    }
}
