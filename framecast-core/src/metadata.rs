//! # HDR Colorimetry Metadata
//!
//! Receivers need to know how an HDR frame was encoded. Every HDR frame
//! carries a small XML element describing primaries, transfer, matrix and
//! content light levels:
//!
//! ```text
//! <ndi_color_info primaries="bt_2020" transfer="bt_2100_pq" matrix="bt_2020" max_cll="1000" max_fall="400"/>
//! ```

use crate::pixel_convert::ColorMatrix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primaries {
    BT709,
    BT2020,
}

impl Primaries {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BT709 => "bt_709",
            Self::BT2020 => "bt_2020",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferFunction {
    Sdr,
    Pq,
    Hlg,
}

impl TransferFunction {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sdr => "bt_709",
            Self::Pq => "bt_2100_pq",
            Self::Hlg => "bt_2100_hlg",
        }
    }

    pub fn is_hdr(&self) -> bool {
        !matches!(self, Self::Sdr)
    }
}

impl ColorMatrix {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BT709 => "bt_709",
            Self::BT2020 => "bt_2020",
        }
    }
}

/// Colour description of one outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorimetryDescriptor {
    pub primaries: Primaries,
    pub transfer: TransferFunction,
    /// Maximum content light level, nits
    pub max_cll: f64,
    /// Maximum frame-average light level, nits
    pub max_fall: f64,
}

impl ColorimetryDescriptor {
    pub fn new(primaries: Primaries, transfer: TransferFunction, max_cll: f64, max_fall: f64) -> Self {
        Self {
            primaries,
            transfer,
            max_cll,
            max_fall,
        }
    }

    /// Matrix of the samples this labels; HDR transfers only travel with Planar16
    pub fn matrix(&self) -> ColorMatrix {
        ColorMatrix::for_transfer(self.transfer)
    }
}

fn nits(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Builds the metadata string, caching the last result
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    last: Option<(ColorimetryDescriptor, String)>,
    builds: u64,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure mapping from descriptor to metadata text
    pub fn build(desc: &ColorimetryDescriptor) -> String {
        format!(
            "<ndi_color_info primaries=\"{}\" transfer=\"{}\" matrix=\"{}\" max_cll=\"{}\" max_fall=\"{}\"/>",
            desc.primaries.tag(),
            desc.transfer.tag(),
            desc.matrix().tag(),
            nits(desc.max_cll),
            nits(desc.max_fall),
        )
    }

    /// Same as [`MetadataBuilder::build`], reusing the previous string when
    /// the descriptor has not changed
    pub fn cached(&mut self, desc: &ColorimetryDescriptor) -> &str {
        let stale = !matches!(&self.last, Some((prev, _)) if prev == desc);
        if stale {
            self.builds += 1;
            self.last = Some((*desc, Self::build(desc)));
        }
        match &self.last {
            Some((_, text)) => text.as_str(),
            None => "",
        }
    }

    /// How many times the string was actually rebuilt
    pub fn builds(&self) -> u64 {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pq_metadata() {
        let desc = ColorimetryDescriptor::new(Primaries::BT2020, TransferFunction::Pq, 1000.0, 400.0);
        assert_eq!(
            MetadataBuilder::build(&desc),
            "<ndi_color_info primaries=\"bt_2020\" transfer=\"bt_2100_pq\" matrix=\"bt_2020\" max_cll=\"1000\" max_fall=\"400\"/>"
        );
    }

    #[test]
    fn test_hlg_and_sdr_tags() {
        let hlg = ColorimetryDescriptor::new(Primaries::BT2020, TransferFunction::Hlg, 0.0, 0.0);
        assert!(MetadataBuilder::build(&hlg).contains("transfer=\"bt_2100_hlg\""));

        let sdr = ColorimetryDescriptor::new(Primaries::BT709, TransferFunction::Sdr, 100.0, 50.0);
        let text = MetadataBuilder::build(&sdr);
        assert!(text.contains("primaries=\"bt_709\""));
        assert!(text.contains("matrix=\"bt_709\""));
    }

    #[test]
    fn test_light_levels_sanitised() {
        let desc = ColorimetryDescriptor::new(Primaries::BT2020, TransferFunction::Pq, f64::NAN, -3.0);
        let text = MetadataBuilder::build(&desc);
        assert!(text.contains("max_cll=\"0\""));
        assert!(text.contains("max_fall=\"0\""));
    }

    #[test]
    fn test_cache_rebuilds_on_change() {
        let mut builder = MetadataBuilder::new();
        let a = ColorimetryDescriptor::new(Primaries::BT2020, TransferFunction::Pq, 1000.0, 400.0);
        let b = ColorimetryDescriptor { max_cll: 4000.0, ..a };

        let first = builder.cached(&a).to_string();
        assert_eq!(builder.cached(&a), first);
        assert_eq!(builder.builds(), 1);

        assert!(builder.cached(&b).contains("max_cll=\"4000\""));
        assert_eq!(builder.builds(), 2);
    }
}
