use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure that can be loaded from CLI, config file, or environment
///
/// Example configuration file content
/// # Video Retime Configuration
///
/// # Server configuration
/// listen_on_port = 32146
/// permits = 2
/// token_rate = 0.0
/// workspace = "./data"
///
/// # Speed bounds accepted by the upload endpoint
/// min_speed = 0.1
/// max_speed = 8.0
///
/// # Encoding defaults passed to ffmpeg
/// crf = 18
/// preset = "ultrafast"
/// audio_bitrate = "192k"
/// ffmpeg_path = "ffmpeg"
///
/// # Webhook configuration (optional)
/// webhook_url = "https://example.com/webhook"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 32146)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Number of concurrent ffmpeg invocations
    #[arg(short, long, default_value_t = 2)]
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// Download bandwidth limit in bytes per second (0.0 = disabled)
    #[arg(short, long, default_value_t = 0.0)]
    #[serde(default = "default_token_rate")]
    pub token_rate: f64,

    /// Working directory for file storage
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Smallest speed factor accepted by the upload endpoint
    #[arg(long, default_value_t = 0.1)]
    #[serde(default = "default_min_speed")]
    pub min_speed: f64,

    /// Largest speed factor accepted by the upload endpoint
    #[arg(long, default_value_t = 8.0)]
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,

    /// Default x264 CRF for retimed output (0-51)
    #[arg(long, default_value_t = 18)]
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// x264 encoder preset
    #[arg(long, default_value = "ultrafast")]
    #[serde(default = "default_preset")]
    pub preset: String,

    /// AAC audio bitrate for retimed output
    #[arg(long, default_value = "192k")]
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Path to the ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Webhook URL to call when jobs complete
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            permits: default_permits(),
            token_rate: default_token_rate(),
            workspace: default_workspace(),
            config: None,
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            crf: default_crf(),
            preset: default_preset(),
            audio_bitrate: default_audio_bitrate(),
            ffmpeg_path: default_ffmpeg_path(),
            webhook_url: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.permits == default_permits() {
            self.permits = file_config.permits;
        }
        if self.token_rate == default_token_rate() {
            self.token_rate = file_config.token_rate;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.min_speed == default_min_speed() {
            self.min_speed = file_config.min_speed;
        }
        if self.max_speed == default_max_speed() {
            self.max_speed = file_config.max_speed;
        }
        if self.crf == default_crf() {
            self.crf = file_config.crf;
        }
        if self.preset == default_preset() {
            self.preset = file_config.preset;
        }
        if self.audio_bitrate == default_audio_bitrate() {
            self.audio_bitrate = file_config.audio_bitrate;
        }
        if self.ffmpeg_path == default_ffmpeg_path() {
            self.ffmpeg_path = file_config.ffmpeg_path;
        }

        // For Option fields, CLI takes precedence if Some
        if self.webhook_url.is_none() {
            self.webhook_url = file_config.webhook_url;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.min_speed.is_finite() && self.min_speed > 0.0) {
            return Err(anyhow::anyhow!(
                "min_speed must be a positive finite number, got {}",
                self.min_speed
            ));
        }
        if !(self.max_speed.is_finite() && self.max_speed >= self.min_speed) {
            return Err(anyhow::anyhow!(
                "max_speed must be finite and >= min_speed, got {}",
                self.max_speed
            ));
        }
        if self.crf > 51 {
            return Err(anyhow::anyhow!("crf can only be set in the range 0-51"));
        }
        if self.preset.is_empty() {
            return Err(anyhow::anyhow!("preset cannot be empty"));
        }
        if self.audio_bitrate.is_empty() {
            return Err(anyhow::anyhow!("audio_bitrate cannot be empty"));
        }
        if self.ffmpeg_path.is_empty() {
            return Err(anyhow::anyhow!("ffmpeg_path cannot be empty"));
        }

        // Validate webhook configuration
        if let Some(webhook_url) = &self.webhook_url {
            if webhook_url.is_empty() {
                return Err(anyhow::anyhow!("Webhook URL cannot be empty"));
            }
            if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "Webhook URL must start with http:// or https://"
                ));
            }
        }

        Ok(())
    }

    /// ffmpeg invocation settings shared by every retime job
    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            default_crf: self.crf,
            preset: self.preset.clone(),
            audio_bitrate: self.audio_bitrate.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub ffmpeg_path: String,
    pub default_crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
}

// Default value functions
fn default_port() -> u16 {
    32146
}

fn default_permits() -> usize {
    2
}

fn default_token_rate() -> f64 {
    0.0
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_min_speed() -> f64 {
    0.1
}

fn default_max_speed() -> f64 {
    8.0
}

fn default_crf() -> u8 {
    18
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_speed, 0.1);
        assert_eq!(config.max_speed, 8.0);
        assert_eq!(config.crf, 18);
    }

    #[test]
    fn validate_rejects_bad_speed_bounds() {
        let config = Config {
            min_speed: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_speed: 0.05, // below min_speed
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_crf() {
        let config = Config {
            crf: 52,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_webhook_url() {
        let mut config = Config {
            webhook_url: Some("ftp://example.com".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.webhook_url = Some("https://example.com/hook".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_fill_in_defaults() {
        let file_config: Config = toml::from_str(
            r#"
            listen_on_port = 9000
            max_speed = 4.0
            webhook_url = "https://example.com/hook"
            "#,
        )
        .unwrap();

        let merged = Config::default().merge_with_file(file_config);
        assert_eq!(merged.listen_on_port, 9000);
        assert_eq!(merged.max_speed, 4.0);
        assert_eq!(merged.min_speed, 0.1);
        assert_eq!(
            merged.webhook_url.as_deref(),
            Some("https://example.com/hook")
        );
    }
}
