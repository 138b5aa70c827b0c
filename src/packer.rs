//! Input packing: turns an image into the flat float buffer the model reads.

use image::{imageops, imageops::FilterType, GenericImageView, Pixel, Primitive, Rgb};
use ndarray::Array4;
use num_traits::AsPrimitive;

use crate::errors::{Result, SegmenterError};

/// Model input resolution (square).
pub const INPUT_SIZE: u32 = 257;
/// RGB, alpha is dropped.
pub const CHANNELS: usize = 3;
const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

/// Flat, row-major, channel-interleaved `f32` buffer in native byte order.
///
/// Produced fresh per request and handed to the model exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBuffer {
    size: u32,
    bytes: Vec<u8>,
}

impl InputBuffer {
    pub const fn expected_len(size: u32) -> usize {
        size as usize * size as usize * CHANNELS * FLOAT_BYTES
    }

    pub fn from_bytes(size: u32, bytes: Vec<u8>) -> Result<Self> {
        let expected = Self::expected_len(size);
        if bytes.len() != expected {
            return Err(SegmenterError::InvalidBufferSize {
                buffer: "input",
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { size, bytes })
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn floats(&self) -> impl Iterator<Item = f32> + '_ {
        self.bytes
            .chunks_exact(FLOAT_BYTES)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// NHWC view `(1, size, size, 3)` for the inference runtime.
    pub fn to_tensor(&self) -> Result<Array4<f32>> {
        let size = self.size as usize;
        Ok(Array4::from_shape_vec(
            (1, size, size, CHANNELS),
            self.floats().collect(),
        )?)
    }
}

/// `(c - 127) / 255` on the 8-bit scale.
#[inline]
pub fn normalize_channel(value: f32) -> f32 {
    (value - 127.0) / 255.0
}

/// Resize `image` to `size x size` and pack its RGB channels.
///
/// The aspect ratio is not preserved, the model expects a fixed square.
/// Subpixels wider than 8 bits are rescaled to the 0..=255 range first.
pub fn pack_input<I, P, S>(image: &I, size: u32) -> Result<InputBuffer>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S> + 'static,
    S: Primitive + AsPrimitive<f32> + 'static,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || size == 0 {
        return Err(SegmenterError::InvalidImage { width, height });
    }

    let resized = imageops::resize(image, size, size, FilterType::Triangle);

    let max: f32 = S::DEFAULT_MAX_VALUE.as_();
    let scale = 255.0 / max;

    let mut bytes = Vec::with_capacity(InputBuffer::expected_len(size));
    for pixel in resized.pixels() {
        let Rgb([r, g, b]) = pixel.to_rgb();
        for channel in [r, g, b] {
            let value: f32 = channel.as_();
            let value = if scale == 1.0 { value } else { value * scale };
            bytes.extend_from_slice(&normalize_channel(value).to_ne_bytes());
        }
    }

    InputBuffer::from_bytes(size, bytes)
}
