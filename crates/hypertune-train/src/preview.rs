//! Preview renders taken during training

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, TrainError};

/// Denoising steps used for caption-driven previews
pub const CAPTION_PREVIEW_STEPS: usize = 20;

/// Parameters for one preview generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewRequest {
    pub prompt: String,
    pub negative_prompt: String,
    /// Number of denoising steps
    pub steps: usize,
    /// Sampler name as understood by the image pipeline
    pub sampler: String,
    /// Classifier-free guidance scale
    pub cfg_scale: f64,
    /// Noise seed, -1 for random
    pub seed: i64,
    pub width: usize,
    pub height: usize,
}

impl PreviewRequest {
    /// Preview of a training caption with default settings
    pub fn from_caption(caption: impl Into<String>) -> Self {
        Self {
            prompt: caption.into(),
            steps: CAPTION_PREVIEW_STEPS,
            ..Default::default()
        }
    }
}

impl Default for PreviewRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: CAPTION_PREVIEW_STEPS,
            sampler: "Euler a".to_string(),
            cfg_scale: 7.0,
            seed: -1,
            width: 512,
            height: 512,
        }
    }
}

/// Generated image output
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA
}

impl GeneratedImage {
    /// Wrap RGBA pixel data, checking its length
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(TrainError::Preview(format!(
                "expected {} bytes of RGBA data, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        image::save_buffer(
            path,
            &self.data,
            self.width,
            self.height,
            image::ColorType::Rgba8,
        )
        .map_err(|e| TrainError::Preview(e.to_string()))
    }
}
