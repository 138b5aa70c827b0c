use image::RgbaImage;

use crate::compositor::{composite_destination_in, scale_mask};
use crate::decoder::Mask;
use crate::traits::DisplaySurface;

/// In-memory overlay layer.
#[derive(Debug, Default)]
pub struct OverlayView {
    viewport: (u32, u32),
    scaled_mask: Option<RgbaImage>,
    updates: usize,
}

impl OverlayView {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: (width, height),
            scaled_mask: None,
            updates: 0,
        }
    }

    pub fn set_viewport_dimensions(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    pub fn scaled_mask(&self) -> Option<&RgbaImage> {
        self.scaled_mask.as_ref()
    }

    /// Number of `set_mask` calls that produced a visible mask.
    pub const fn update_count(&self) -> usize {
        self.updates
    }

    /// `base` masked by the current overlay, or `None` if nothing is shown.
    pub fn masked_image(&self, base: &RgbaImage) -> Option<RgbaImage> {
        let mask = self.scaled_mask.as_ref()?;
        composite_destination_in(base, mask, self.viewport)
    }
}

impl DisplaySurface for OverlayView {
    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn set_mask(&mut self, mask: &Mask) {
        self.scaled_mask = scale_mask(mask, self.viewport);
        if self.scaled_mask.is_some() {
            self.updates += 1;
        } else {
            tracing::debug!(
                "skipping overlay for {}x{} mask in {:?} viewport",
                mask.width(),
                mask.height(),
                self.viewport
            );
        }
    }

    fn clear(&mut self) {
        self.scaled_mask = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_category_mask;
    use image::Rgba;

    #[test]
    fn test_set_mask_scales_to_viewport() -> crate::Result<()> {
        let mut view = OverlayView::new(100, 50);
        let mask = decode_category_mask(&[1; 16], 4, 4)?;

        view.set_mask(&mask);
        let scaled = view.scaled_mask().unwrap();
        assert_eq!(scaled.dimensions(), (50, 50));
        assert_eq!(view.update_count(), 1);
        Ok(())
    }

    #[test]
    fn test_zero_viewport_skips_update() -> crate::Result<()> {
        let mut view = OverlayView::default();
        let mask = decode_category_mask(&[1; 4], 2, 2)?;

        view.set_mask(&mask);
        assert!(view.scaled_mask().is_none());
        assert_eq!(view.update_count(), 0);
        Ok(())
    }

    #[test]
    fn test_clear_removes_mask() -> crate::Result<()> {
        let mut view = OverlayView::new(2, 2);
        view.set_mask(&decode_category_mask(&[1; 4], 2, 2)?);
        view.clear();

        let base = RgbaImage::from_pixel(2, 2, Rgba([9, 9, 9, 255]));
        assert!(view.masked_image(&base).is_none());
        Ok(())
    }

    #[test]
    fn test_masked_image_uses_viewport() -> crate::Result<()> {
        let mut view = OverlayView::new(4, 2);
        view.set_mask(&decode_category_mask(&[0, 1], 2, 1)?);

        let base = RgbaImage::from_pixel(4, 2, Rgba([9, 8, 7, 255]));
        let result = view.masked_image(&base).unwrap();
        assert_eq!(result.dimensions(), (4, 2));
        assert_eq!(result.get_pixel(0, 0)[3], 0);
        assert_eq!(result.get_pixel(3, 1), &Rgba([9, 8, 7, 255]));
        Ok(())
    }
}
