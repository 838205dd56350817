//! Icon formats and per-request conversion options.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Image container formats known to the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IconFormat {
    Svg,
    Png,
    Ico,
    Icns,
}

impl IconFormat {
    /// Returns true if this format can be read by the converter.
    pub fn is_input(self) -> bool {
        matches!(self, IconFormat::Svg | IconFormat::Png)
    }

    /// Returns true if this format can be produced by the converter.
    pub fn is_output(self) -> bool {
        matches!(self, IconFormat::Png | IconFormat::Ico | IconFormat::Icns)
    }

    /// Checks that `from -> to` is a supported conversion.
    pub fn check_pair(from: IconFormat, to: IconFormat) -> Result<(), ValidationError> {
        if from.is_input() && to.is_output() {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedFormatPair { from, to })
        }
    }

    /// Infers the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }

    pub fn extension(self) -> &'static str {
        match self {
            IconFormat::Svg => "svg",
            IconFormat::Png => "png",
            IconFormat::Ico => "ico",
            IconFormat::Icns => "icns",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            IconFormat::Svg => "image/svg+xml",
            IconFormat::Png => "image/png",
            IconFormat::Ico => "image/x-icon",
            IconFormat::Icns => "image/icns",
        }
    }
}

impl fmt::Display for IconFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for IconFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svg" => Ok(IconFormat::Svg),
            "png" => Ok(IconFormat::Png),
            "ico" => Ok(IconFormat::Ico),
            "icns" => Ok(IconFormat::Icns),
            other => Err(format!("unknown icon format: {other}")),
        }
    }
}

/// Colour layout of PNG output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorSpace {
    #[default]
    Rgba,
    Rgb,
    Grayscale,
    GrayscaleAlpha,
}

impl FromStr for ColorSpace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgba" => Ok(ColorSpace::Rgba),
            "rgb" => Ok(ColorSpace::Rgb),
            "grayscale" | "gray" => Ok(ColorSpace::Grayscale),
            "grayscale-alpha" | "gray-alpha" => Ok(ColorSpace::GrayscaleAlpha),
            other => Err(format!("unknown color space: {other}")),
        }
    }
}

/// Bits per PNG sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    #[default]
    Eight,
    Sixteen,
}

impl TryFrom<u8> for BitDepth {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(BitDepth::Eight),
            16 => Ok(BitDepth::Sixteen),
            other => Err(format!("unsupported bit depth: {other}")),
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> Self {
        match depth {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }
}

/// Settings that only affect PNG output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PngOptions {
    pub dpi: Option<u32>,
    pub color_space: ColorSpace,
    pub bit_depth: BitDepth,
}

/// Largest edge the converter will render, in pixels.
pub const MAX_OUTPUT_SIZE: u32 = 1024;

/// Upper bound for DPI metadata.
const MAX_DPI: u32 = 10_000;

/// Per-request conversion options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// Content scale inside the square canvas, in `(0, 1]`.
    pub scale: f32,
    /// Corner rounding as a fraction of the edge length, in `[0, 0.5]`.
    pub corner_radius: f32,
    /// Make pixels matching the opaque top-left colour transparent.
    pub remove_background: bool,
    /// Largest output edge. Multi-resolution formats drop bigger frames.
    pub output_size: Option<u32>,
    pub png: PngOptions,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            corner_radius: 0.0,
            remove_background: false,
            output_size: None,
            png: PngOptions::default(),
        }
    }
}

impl ConversionOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(ValidationError::InvalidOption(format!(
                "scale must be in (0, 1], got {}",
                self.scale
            )));
        }
        if !(0.0..=0.5).contains(&self.corner_radius) {
            return Err(ValidationError::InvalidOption(format!(
                "corner_radius must be in [0, 0.5], got {}",
                self.corner_radius
            )));
        }
        if let Some(size) = self.output_size {
            if size == 0 || size > MAX_OUTPUT_SIZE {
                return Err(ValidationError::InvalidOption(format!(
                    "output_size must be in [1, {MAX_OUTPUT_SIZE}], got {size}"
                )));
            }
        }
        if let Some(dpi) = self.png.dpi {
            if dpi == 0 || dpi > MAX_DPI {
                return Err(ValidationError::InvalidOption(format!(
                    "dpi must be in [1, {MAX_DPI}], got {dpi}"
                )));
            }
        }
        Ok(())
    }
}
