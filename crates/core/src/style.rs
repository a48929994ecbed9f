//! Built-in style presets.
//!
//! A preset supplies the positive prompt text when the caller does not
//! provide a custom prompt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Style applied to the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StylePreset {
    #[default]
    Clay,
    Anime,
    Realistic,
    Cartoon,
    OilPainting,
}

impl StylePreset {
    pub const ALL: [StylePreset; 5] = [
        StylePreset::Clay,
        StylePreset::Anime,
        StylePreset::Realistic,
        StylePreset::Cartoon,
        StylePreset::OilPainting,
    ];

    /// Positive prompt text for this preset.
    pub fn prompt(self) -> &'static str {
        match self {
            StylePreset::Clay => "Clay Style, lovely, 3d, cute",
            StylePreset::Anime => "Anime Style, beautiful, detailed",
            StylePreset::Realistic => "Realistic Style, high quality, detailed",
            StylePreset::Cartoon => "Cartoon Style, colorful, fun",
            StylePreset::OilPainting => "Oil Painting Style, artistic, classical",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StylePreset::Clay => "clay",
            StylePreset::Anime => "anime",
            StylePreset::Realistic => "realistic",
            StylePreset::Cartoon => "cartoon",
            StylePreset::OilPainting => "oil_painting",
        }
    }
}

impl fmt::Display for StylePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StylePreset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StylePreset::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown style preset '{s}'")))
    }
}
