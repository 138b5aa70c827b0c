//! Output decoding: raw model output to an ARGB overlay mask.

use image::{Rgba, RgbaImage};
use ndarray::{ArrayView3, Axis};

use crate::errors::{Result, SegmenterError};

/// Class count the category mask is folded into. This is a fixed constant,
/// not the model's real label count (DeepLabV3 has 21).
pub const CLASS_COUNT: u8 = 20;
pub const TRANSPARENT: u32 = 0x0000_0000;
/// Opaque blue, ARGB.
pub const HIGHLIGHT: u32 = 0xFF00_00FF;
pub const ALPHA_COLOR: u8 = 128;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[inline]
pub const fn argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

#[inline]
pub const fn alpha(color: u32) -> u8 {
    (color >> 24) as u8
}

/// Replace the alpha channel of `color` with [`ALPHA_COLOR`].
pub const fn to_alpha_color(color: u32) -> u32 {
    (color & 0x00FF_FFFF) | (ALPHA_COLOR as u32) << 24
}

/// Raw model output, one value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputBuffer {
    /// Class index per pixel.
    Category {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    /// Foreground confidence in `0.0..=1.0` per pixel.
    Confidence {
        width: u32,
        height: u32,
        data: Vec<f32>,
    },
}

impl OutputBuffer {
    pub const fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Category { width, height, .. } | Self::Confidence { width, height, .. } => {
                (*width, *height)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Category { data, .. } => data.len(),
            Self::Confidence { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded overlay: ARGB pixels, row-major, at the model output's resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Mask {
    /// `pixels` must hold exactly `width * height` entries.
    pub fn new(width: u32, height: u32, pixels: Vec<u32>) -> Result<Self> {
        check_len("mask", pixels.len(), width, height)?;
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let color = self.pixel(x, y).unwrap_or(TRANSPARENT);
            Rgba([
                (color >> 16) as u8,
                (color >> 8) as u8,
                color as u8,
                alpha(color),
            ])
        })
    }
}

/// Maps model output to overlay colors.
///
/// The default decoder folds every byte into [`CLASS_COUNT`] classes and paints
/// every non-background class with one highlight color. A palette gives each
/// class its own translucent color instead.
#[derive(Debug, Clone)]
pub struct MaskDecoder {
    class_count: u8,
    highlight: u32,
    palette: Option<Vec<u32>>,
    confidence_threshold: f32,
}

impl Default for MaskDecoder {
    fn default() -> Self {
        Self {
            class_count: CLASS_COUNT,
            highlight: HIGHLIGHT,
            palette: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl MaskDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class_count(mut self, class_count: u8) -> Self {
        self.class_count = class_count.max(1);
        self
    }

    pub const fn with_highlight(mut self, color: u32) -> Self {
        self.highlight = color;
        self
    }

    /// Per-class colors, indexed by class. Entries are made translucent.
    /// Class 0 always stays transparent.
    pub fn with_palette(mut self, palette: Vec<u32>) -> Self {
        self.palette = Some(palette.into_iter().map(to_alpha_color).collect());
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn class_color(&self, value: u8) -> u32 {
        let class = value % self.class_count;
        if class == 0 {
            return TRANSPARENT;
        }
        match &self.palette {
            Some(palette) => palette
                .get(class as usize)
                .copied()
                .unwrap_or(self.highlight),
            None => self.highlight,
        }
    }

    pub fn decode_category(&self, bytes: &[u8], width: u32, height: u32) -> Result<Mask> {
        check_len("category mask", bytes.len(), width, height)?;
        Mask::new(width, height, bytes.iter().map(|&b| self.class_color(b)).collect())
    }

    pub fn decode_confidence(&self, values: &[f32], width: u32, height: u32) -> Result<Mask> {
        check_len("confidence mask", values.len(), width, height)?;
        let pixels = values
            .iter()
            .map(|&v| {
                if v > self.confidence_threshold {
                    self.highlight
                } else {
                    TRANSPARENT
                }
            })
            .collect();
        Mask::new(width, height, pixels)
    }

    pub fn decode(&self, output: &OutputBuffer) -> Result<Mask> {
        match output {
            OutputBuffer::Category {
                width,
                height,
                data,
            } => self.decode_category(data, *width, *height),
            OutputBuffer::Confidence {
                width,
                height,
                data,
            } => self.decode_confidence(data, *width, *height),
        }
    }
}

/// Decode a category mask with the default class folding and highlight.
pub fn decode_category_mask(bytes: &[u8], width: u32, height: u32) -> Result<Mask> {
    MaskDecoder::default().decode_category(bytes, width, height)
}

/// Argmax over the channel axis of an `(H, W, C)` logit tensor.
pub fn category_mask_from_logits(logits: ArrayView3<f32>) -> Vec<u8> {
    logits
        .lanes(Axis(2))
        .into_iter()
        .map(|scores| {
            scores
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, &s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                })
                .0
                .min(u8::MAX as usize) as u8
        })
        .collect()
}

fn check_len(buffer: &'static str, actual: usize, width: u32, height: u32) -> Result<()> {
    let expected = width as usize * height as usize;
    if actual != expected {
        return Err(SegmenterError::InvalidBufferSize {
            buffer,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_three_by_three_scenario() -> Result<()> {
        let bytes = [0, 1, 2, 0, 1, 2, 0, 1, 2];
        let mask = decode_category_mask(&bytes, 3, 3)?;

        assert_eq!(mask.pixels().len(), 9);
        for (i, &pixel) in mask.pixels().iter().enumerate() {
            if i % 3 == 0 {
                assert_eq!(pixel, TRANSPARENT, "position {} should be transparent", i);
            } else {
                assert_eq!(pixel, HIGHLIGHT, "position {} should be highlighted", i);
            }
        }
        Ok(())
    }

    #[test]
    fn test_class_index_wraps_at_class_count() -> Result<()> {
        let bytes = [20, 40, 21, 255];
        let mask = decode_category_mask(&bytes, 2, 2)?;

        assert_eq!(mask.pixels()[0], TRANSPARENT);
        assert_eq!(mask.pixels()[1], TRANSPARENT);
        assert_eq!(mask.pixels()[2], HIGHLIGHT);
        // 255 % 20 = 15
        assert_eq!(mask.pixels()[3], HIGHLIGHT);
        Ok(())
    }

    #[test]
    fn test_every_multiple_of_class_count_is_transparent() -> Result<()> {
        let bytes: Vec<u8> = (0..=255).collect();
        let mask = decode_category_mask(&bytes, 16, 16)?;

        assert_eq!(mask.pixels().len(), bytes.len());
        for (byte, pixel) in bytes.iter().zip(mask.pixels()) {
            assert_eq!(*pixel == TRANSPARENT, byte % CLASS_COUNT == 0);
        }
        Ok(())
    }

    #[test]
    fn test_decoding_is_idempotent() -> Result<()> {
        let bytes = [3, 0, 17, 40, 9, 0];
        let first = decode_category_mask(&bytes, 3, 2)?;
        let second = decode_category_mask(&bytes, 3, 2)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_mismatched_dimensions_are_rejected() {
        let result = decode_category_mask(&[0, 1, 2], 2, 2);
        assert!(matches!(
            result,
            Err(SegmenterError::InvalidBufferSize {
                expected: 4,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_palette_colors_are_translucent() -> Result<()> {
        let decoder = MaskDecoder::new().with_palette(vec![
            argb(255, 0, 0, 0),
            argb(255, 255, 0, 0),
            argb(255, 0, 255, 0),
        ]);
        let mask = decoder.decode_category(&[0, 1, 2, 3], 4, 1)?;

        assert_eq!(mask.pixels()[0], TRANSPARENT);
        assert_eq!(mask.pixels()[1], argb(128, 255, 0, 0));
        assert_eq!(mask.pixels()[2], argb(128, 0, 255, 0));
        // classes past the palette fall back to the highlight
        assert_eq!(mask.pixels()[3], HIGHLIGHT);
        Ok(())
    }

    #[test]
    fn test_confidence_mask_threshold() -> Result<()> {
        let output = OutputBuffer::Confidence {
            width: 2,
            height: 2,
            data: vec![0.1, 0.5, 0.51, 1.0],
        };
        let mask = MaskDecoder::default().decode(&output)?;
        assert_eq!(
            mask.pixels(),
            vec![TRANSPARENT, TRANSPARENT, HIGHLIGHT, HIGHLIGHT]
        );
        Ok(())
    }

    #[test]
    fn test_logits_argmax() {
        let mut logits = Array3::<f32>::zeros((1, 3, 4));
        logits[[0, 0, 0]] = 1.0;
        logits[[0, 1, 2]] = 0.7;
        logits[[0, 1, 3]] = 0.9;
        logits[[0, 2, 1]] = -1.0;
        logits[[0, 2, 3]] = -0.5;

        let classes = category_mask_from_logits(logits.view());
        assert_eq!(classes, vec![0, 3, 0]);
    }

    #[test]
    fn test_mask_rejects_mismatched_pixel_count() {
        let result = Mask::new(3, 2, vec![HIGHLIGHT; 5]);
        assert!(matches!(
            result,
            Err(SegmenterError::InvalidBufferSize {
                buffer: "mask",
                expected: 6,
                actual: 5,
            })
        ));
        assert!(Mask::new(0, 0, Vec::new()).is_ok());
    }

    #[test]
    fn test_mask_to_rgba_image() -> Result<()> {
        let mask = decode_category_mask(&[0, 5], 2, 1)?;
        let image = mask.to_rgba_image();

        assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgba([0, 0, 255, 255]));
        assert_eq!(mask.pixel(1, 0), Some(HIGHLIGHT));
        assert_eq!(mask.pixel(2, 0), None);
        Ok(())
    }
}
