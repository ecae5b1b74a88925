//! Pipeline configuration
//!
//! Mirrors the `app_params` JSON document that drives a deployment:
//!
//! ```json
//! {
//!     "app_params": {
//!         "source": { "source": "0", "width": 640, "height": 480 },
//!         "engine": { "model_path": "ssd.tflite", "label_path": "labels.txt", "top_k": 5, "threshold": 0.5 },
//!         "postprocessor": { "output_resolution": "640x480" },
//!         "stream_spi": true,
//!         "stream_flask": false
//!     }
//! }
//! ```
//!
//! Every field has a default, so partial documents are accepted.

use crate::link::LinkSettings;
use crate::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub engine: EngineConfig,
    pub postprocessor: PostprocessorConfig,
    /// Stream flattened results to the microcontroller
    #[serde(alias = "stream_spi")]
    pub stream_serial: bool,
    /// Serve the annotated video stream
    #[serde(alias = "stream_flask")]
    pub stream_http: bool,
    pub idle_timeout_ms: u64,
    pub eviction_window_ms: u64,
    pub watchdog_threshold_ms: u64,
    pub link: LinkSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            engine: EngineConfig::default(),
            postprocessor: PostprocessorConfig::default(),
            stream_serial: false,
            stream_http: false,
            idle_timeout_ms: 10_000,
            eviction_window_ms: 5_000,
            watchdog_threshold_ms: 5_000,
            link: LinkSettings::default(),
        }
    }
}

#[derive(Deserialize)]
struct Wrapped {
    app_params: PipelineConfig,
}

impl PipelineConfig {
    /// Parse either a bare config object or one wrapped in `{"app_params": ...}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let config: PipelineConfig = if value.get("app_params").is_some() {
            serde_json::from_value::<Wrapped>(value)?.app_params
        } else {
            serde_json::from_value(value)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<()> {
        parse_resolution(&self.postprocessor.output_resolution)?;
        if self.engine.top_k == 0 {
            return Err(StreamError::InvalidConfig("engine.top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.engine.threshold) {
            return Err(StreamError::InvalidConfig(format!(
                "engine.threshold must be within 0..1, got {}",
                self.engine.threshold
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig("idle_timeout_ms must be positive".into()));
        }
        self.link.validate()?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn eviction_window(&self) -> Duration {
        Duration::from_millis(self.eviction_window_ms)
    }

    pub fn watchdog_threshold(&self) -> Duration {
        Duration::from_millis(self.watchdog_threshold_ms)
    }

    /// Output resolution of the visual postprocessor
    pub fn output_resolution(&self) -> Result<(u32, u32)> {
        parse_resolution(&self.postprocessor.output_resolution)
    }
}

/// Capture device settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Device index or path, as understood by the capture backend
    #[serde(alias = "source")]
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Inference settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model_path: String,
    pub label_path: Option<String>,
    /// Maximum number of detections per frame
    pub top_k: usize,
    /// Minimum score of reported detections
    pub threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            label_path: None,
            top_k: 5,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PostprocessorConfig {
    /// `"WIDTHxHEIGHT"`
    pub output_resolution: String,
}

impl Default for PostprocessorConfig {
    fn default() -> Self {
        Self {
            output_resolution: "640x480".to_string(),
        }
    }
}

/// Parse a `"WIDTHxHEIGHT"` resolution string (case-insensitive `x`)
pub fn parse_resolution(resolution: &str) -> Result<(u32, u32)> {
    let invalid = || {
        StreamError::InvalidConfig(format!(
            "resolution must be of the form 'WIDTHxHEIGHT', got '{}'",
            resolution
        ))
    };
    let lower = resolution.trim().to_ascii_lowercase();
    let (width, height) = lower.split_once('x').ok_or_else(invalid)?;
    let width: u32 = width.trim().parse().map_err(|_| invalid())?;
    let height: u32 = height.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_document() {
        let json = r#"{
            "app_params": {
                "source": { "source": "/dev/video1" },
                "engine": { "model_path": "m.tflite", "label_path": "l.txt", "top_k": 3, "threshold": 0.4 },
                "postprocessor": { "output_resolution": "320X240" },
                "stream_spi": true,
                "stream_flask": false
            }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.source.device, "/dev/video1");
        assert_eq!(config.source.width, 640);
        assert_eq!(config.engine.top_k, 3);
        assert_eq!(config.engine.label_path.as_deref(), Some("l.txt"));
        assert!(config.stream_serial);
        assert!(!config.stream_http);
        assert_eq!(config.output_resolution().unwrap(), (320, 240));
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_bare_document_with_link_overrides() {
        let json = r#"{ "engine": { "top_k": 2 }, "link": { "max_error_count": 10, "tick_interval_ms": 5 } }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.engine.top_k, 2);
        assert_eq!(config.link.max_error_count, 10);
        assert_eq!(config.link.tick_interval(), Duration::from_millis(5));
        assert_eq!(config.link.handshake_window(), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "postprocessor": { "output_resolution": "640-480" } }"#),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "engine": { "top_k": 0 } }"#),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "engine": { "top_k": "five" } }"#),
            Err(StreamError::Config(_))
        ));
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("640x480").unwrap(), (640, 480));
        assert_eq!(parse_resolution(" 1280X720 ").unwrap(), (1280, 720));
        assert!(parse_resolution("640").is_err());
        assert!(parse_resolution("0x480").is_err());
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_params.json");
        std::fs::write(&path, r#"{"app_params": {"stream_flask": true}}"#).unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert!(config.stream_http);
        assert!(matches!(
            PipelineConfig::from_json_file(dir.path().join("missing.json")),
            Err(StreamError::Io(_))
        ));
    }
}
