use crate::decoder::{Mask, OutputBuffer};
use crate::errors::Result;
use crate::packer::InputBuffer;

/// Segmentation model abstraction.
///
/// The model is a black box `InputBuffer -> OutputBuffer`; its input and
/// output layouts are dictated by the model file.
pub trait SegmentationModel: Send + Sync {
    /// Square input resolution the model expects.
    fn input_size(&self) -> u32;

    /// Run one inference. May block for the duration of the native call.
    fn run(&self, input: &InputBuffer) -> Result<OutputBuffer>;
}

/// Where decoded masks end up.
///
/// Implementations hold view state, so only the task that owns the surface
/// calls into it.
pub trait DisplaySurface {
    /// Current viewport size, `(width, height)`.
    fn viewport(&self) -> (u32, u32);

    /// Show a new mask, scaled to fit the viewport.
    fn set_mask(&mut self, mask: &Mask);

    /// Drop whatever mask is shown.
    fn clear(&mut self);
}
