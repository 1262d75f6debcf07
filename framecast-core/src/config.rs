//! # Sender Configuration
//!
//! Everything the host can change between frames. Loaded from JSON; any
//! missing field takes its default.
//!
//! ```json
//! { "enabled": true, "hdr_enabled": true, "transfer_function": "Pq",
//!   "max_cll": 1000.0, "async_sending": true }
//! ```

use crate::frame::{ColorMode, PixelLayout};
use crate::metadata::{ColorimetryDescriptor, Primaries, TransferFunction};
use crate::transport::frame_rate_fraction;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Host frame-rate parameter range
pub const MIN_FRAME_RATE: f64 = 1.0;
pub const MAX_FRAME_RATE: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    BT709,
    BT2020,
    P3,
}

impl ColorSpace {
    /// Primaries tag sent to receivers. P3 content travels in a BT.2020
    /// container.
    pub fn primaries(&self) -> Primaries {
        match self {
            Self::BT709 => Primaries::BT709,
            Self::BT2020 | Self::P3 => Primaries::BT2020,
        }
    }
}

/// What the async queue does when full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame
    #[default]
    DropOldest,
    /// Wait up to `block_timeout_ms`, then drop the new frame
    BlockProducer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub enabled: bool,
    pub hdr_enabled: bool,
    pub color_space: ColorSpace,
    pub transfer_function: TransferFunction,
    /// Nits
    pub max_cll: f64,
    /// Nits
    pub max_fall: f64,
    pub gpu_acceleration: bool,
    pub async_sending: bool,
    /// Send UYVY instead of RGBA8 for SDR
    pub optimal_format: bool,
    pub frame_rate: f64,
    pub source_name: String,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub block_timeout_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hdr_enabled: false,
            color_space: ColorSpace::BT709,
            transfer_function: TransferFunction::Sdr,
            max_cll: 1000.0,
            max_fall: 400.0,
            gpu_acceleration: true,
            async_sending: false,
            optimal_format: true,
            frame_rate: 30.0,
            source_name: "Framecast Output".to_string(),
            queue_capacity: 8,
            overflow_policy: OverflowPolicy::DropOldest,
            block_timeout_ms: 100,
        }
    }
}

impl SenderConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frame_rate.is_finite()
            || !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&self.frame_rate)
        {
            return Err(ConfigError::Invalid(format!(
                "frame_rate {} outside {}..={}",
                self.frame_rate, MIN_FRAME_RATE, MAX_FRAME_RATE
            )));
        }
        for (name, value) in [("max_cll", self.max_cll), ("max_fall", self.max_fall)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be >= 0, got {}", name, value)));
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether moving from `self` to `next` needs the pipeline rebuilt.
    /// Light levels and frame rate apply in place.
    pub fn requires_restart(&self, next: &SenderConfig) -> bool {
        self.hdr_enabled != next.hdr_enabled
            || self.color_space != next.color_space
            || self.transfer_function != next.transfer_function
            || self.source_name != next.source_name
            || self.gpu_acceleration != next.gpu_acceleration
            || self.async_sending != next.async_sending
            || self.optimal_format != next.optimal_format
            || self.queue_capacity != next.queue_capacity
            || self.overflow_policy != next.overflow_policy
    }

    pub fn color_mode(&self) -> ColorMode {
        if self.hdr_enabled {
            ColorMode::Hdr
        } else {
            ColorMode::Sdr
        }
    }

    pub fn layout(&self) -> PixelLayout {
        match (self.hdr_enabled, self.optimal_format) {
            (true, _) => PixelLayout::Planar16_422,
            (false, true) => PixelLayout::Uyvy422,
            (false, false) => PixelLayout::Rgba8,
        }
    }

    /// Transfer function actually applied. SDR output ignores the setting,
    /// HDR output left at SDR is sent as PQ.
    pub fn effective_transfer(&self) -> TransferFunction {
        match (self.hdr_enabled, self.transfer_function) {
            (false, _) => TransferFunction::Sdr,
            (true, TransferFunction::Sdr) => TransferFunction::Pq,
            (true, transfer) => transfer,
        }
    }

    pub fn colorimetry(&self) -> ColorimetryDescriptor {
        ColorimetryDescriptor::new(
            self.color_space.primaries(),
            self.effective_transfer(),
            self.max_cll,
            self.max_fall,
        )
    }

    pub fn frame_rate_fraction(&self) -> (i32, i32) {
        frame_rate_fraction(self.frame_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_convert::ColorMatrix;

    #[test]
    fn test_defaults_are_valid() {
        let config = SenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout(), PixelLayout::Uyvy422);
        assert_eq!(config.frame_rate_fraction(), (30000, 1000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SenderConfig::from_json_str(
            r#"{ "enabled": true, "hdr_enabled": true, "transfer_function": "Hlg" }"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.layout(), PixelLayout::Planar16_422);
        assert_eq!(config.effective_transfer(), TransferFunction::Hlg);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.source_name, "Framecast Output");
    }

    #[test]
    fn test_validation_errors() {
        let bad_rate = SenderConfig {
            frame_rate: 0.5,
            ..Default::default()
        };
        assert!(matches!(bad_rate.validate(), Err(ConfigError::Invalid(_))));

        let nan_cll = SenderConfig {
            max_cll: f64::NAN,
            ..Default::default()
        };
        assert!(nan_cll.validate().is_err());

        let no_queue = SenderConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(no_queue.validate().is_err());

        assert!(matches!(
            SenderConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_restart_rules() {
        let base = SenderConfig::default();

        let brighter = SenderConfig {
            max_cll: 4000.0,
            frame_rate: 60.0,
            ..base.clone()
        };
        assert!(!base.requires_restart(&brighter));

        let hdr = SenderConfig {
            hdr_enabled: true,
            ..base.clone()
        };
        assert!(base.requires_restart(&hdr));

        let renamed = SenderConfig {
            source_name: "Other".into(),
            ..base.clone()
        };
        assert!(base.requires_restart(&renamed));

        // enable toggles are handled separately from restarts
        let enabled = SenderConfig {
            enabled: true,
            ..base.clone()
        };
        assert!(!base.requires_restart(&enabled));
    }

    #[test]
    fn test_layout_selection() {
        let rgba = SenderConfig {
            optimal_format: false,
            ..Default::default()
        };
        assert_eq!(rgba.layout(), PixelLayout::Rgba8);
        assert_eq!(rgba.color_mode(), ColorMode::Sdr);
    }

    #[test]
    fn test_colorimetry_mapping() {
        let config = SenderConfig {
            hdr_enabled: true,
            color_space: ColorSpace::P3,
            transfer_function: TransferFunction::Pq,
            ..Default::default()
        };
        let desc = config.colorimetry();
        assert_eq!(desc.primaries, Primaries::BT2020);
        assert_eq!(desc.transfer, TransferFunction::Pq);

        let sdr = SenderConfig {
            transfer_function: TransferFunction::Pq,
            ..Default::default()
        };
        assert_eq!(sdr.colorimetry().transfer, TransferFunction::Sdr);
    }

    #[test]
    fn test_hdr_with_sdr_transfer_sends_pq() {
        let config = SenderConfig {
            hdr_enabled: true,
            color_space: ColorSpace::BT2020,
            ..Default::default()
        };
        assert_eq!(config.transfer_function, TransferFunction::Sdr);
        assert_eq!(config.effective_transfer(), TransferFunction::Pq);
        assert_eq!(config.colorimetry().matrix(), ColorMatrix::BT2020);
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sender.json");

        let config = SenderConfig {
            enabled: true,
            async_sending: true,
            overflow_policy: OverflowPolicy::BlockProducer,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SenderConfig::load(&path).unwrap(), config);

        assert!(matches!(
            SenderConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
