//! Target output dimensions for a job.
//!
//! Sizes are written as `WIDTHxHEIGHT` (e.g. `768x768`), the same form
//! the size picker offers. Parsing validates bounds so a bad size is
//! rejected before anything is uploaded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/* --------------------------------------------------------------------------
Named constants
-------------------------------------------------------------------------- */

/// Largest accepted width or height, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

/// Preset: 512x512.
pub const SIZE_512: ImageSize = ImageSize {
    width: 512,
    height: 512,
};

/// Preset: 768x768.
pub const SIZE_768: ImageSize = ImageSize {
    width: 768,
    height: 768,
};

/// All built-in size presets.
pub const PRESET_SIZES: &[ImageSize] = &[SIZE_512, SIZE_768];

/* --------------------------------------------------------------------------
Types
-------------------------------------------------------------------------- */

/// Requested output dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    /// Build a size, rejecting zero or oversized dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, CoreError> {
        validate_dimensions(width, height)?;
        Ok(Self { width, height })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (w, h) = lowered.split_once('x').ok_or_else(|| {
            CoreError::Validation(format!(
                "Invalid size '{s}': expected WIDTHxHEIGHT, e.g. 768x768"
            ))
        })?;

        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                CoreError::Validation(format!("Invalid size '{s}': '{part}' is not a number"))
            })
        };

        Self::new(parse(w)?, parse(h)?)
    }
}

/// Validate that width and height are positive and within bounds.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Validation(
            "Width and height must be greater than 0".to_string(),
        ));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(CoreError::Validation(format!(
            "Dimensions must not exceed {MAX_DIMENSION}px (got {width}x{height})"
        )));
    }
    Ok(())
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */
