//! Overlay compositing: fit the mask into the viewport and keep only the parts
//! of the base image the mask covers.

use image::{imageops, imageops::FilterType, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::decoder::Mask;

/// Mask size after uniform scale-to-fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledSize {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

/// `s = min(Vw / W, Vh / H)`. `None` when any dimension is zero.
///
/// The limiting axis is picked with integer arithmetic so the scaled size
/// always matches the viewport exactly on that axis.
pub fn fit_scale(width: u32, height: u32, viewport_width: u32, viewport_height: u32) -> Option<ScaledSize> {
    if width == 0 || height == 0 || viewport_width == 0 || viewport_height == 0 {
        return None;
    }

    let (w, h) = (width as u64, height as u64);
    let (vw, vh) = (viewport_width as u64, viewport_height as u64);

    let size = if vw * h <= vh * w {
        ScaledSize {
            width: viewport_width,
            height: ((h * vw / w) as u32).clamp(1, viewport_height),
            scale: vw as f64 / w as f64,
        }
    } else {
        ScaledSize {
            width: ((w * vh / h) as u32).clamp(1, viewport_width),
            height: viewport_height,
            scale: vh as f64 / h as f64,
        }
    };
    Some(size)
}

/// Nearest-neighbour scale of `mask` to fit inside the viewport.
pub fn scale_mask(mask: &Mask, viewport: (u32, u32)) -> Option<RgbaImage> {
    let size = fit_scale(mask.width(), mask.height(), viewport.0, viewport.1)?;
    let image = mask.to_rgba_image();
    if (size.width, size.height) == image.dimensions() {
        return Some(image);
    }
    Some(imageops::resize(
        &image,
        size.width,
        size.height,
        FilterType::Nearest,
    ))
}

#[inline]
fn destination_in(base: Rgba<u8>, mask_alpha: u8) -> Rgba<u8> {
    let Rgba([r, g, b, a]) = base;
    let alpha = ((a as u32 * mask_alpha as u32 + 127) / 255) as u8;
    if alpha == 0 {
        Rgba([0, 0, 0, 0])
    } else {
        Rgba([r, g, b, alpha])
    }
}

/// Draw `base` at the origin of a viewport-sized canvas, then blend `mask`
/// over it with destination-in: the result keeps base colors with alpha
/// `base.a * mask.a`. Anything outside the mask is transparent.
pub fn composite_destination_in(
    base: &RgbaImage,
    mask: &RgbaImage,
    viewport: (u32, u32),
) -> Option<RgbaImage> {
    let (vw, vh) = viewport;
    let (mw, mh) = mask.dimensions();
    if vw == 0 || vh == 0 || mw == 0 || mh == 0 {
        return None;
    }

    let (bw, bh) = base.dimensions();
    let mut canvas = RgbaImage::new(vw, vh);
    canvas
        .par_chunks_exact_mut(vw as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            if y >= mh || y >= bh {
                return;
            }
            for (x, out) in row.chunks_exact_mut(4).enumerate() {
                let x = x as u32;
                if x >= mw || x >= bw {
                    break;
                }
                let mask_alpha = mask.get_pixel(x, y)[3];
                let Rgba(pixel) = destination_in(*base.get_pixel(x, y), mask_alpha);
                out.copy_from_slice(&pixel);
            }
        });

    Some(canvas)
}

/// Scale `mask` to fit `viewport` and mask `base` with it.
pub fn apply_overlay(base: &RgbaImage, mask: &Mask, viewport: (u32, u32)) -> Option<RgbaImage> {
    let scaled = scale_mask(mask, viewport)?;
    composite_destination_in(base, &scaled, viewport)
}
