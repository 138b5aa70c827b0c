use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::decoder::OutputBuffer;
use crate::errors::{Result, SegmenterError};
use crate::packer::InputBuffer;
use crate::traits::SegmentationModel;

/// Holds model calls until opened. Stands in for a slow native inference call.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<GateState>,
}

#[derive(Default)]
struct GateState {
    open: Mutex<bool>,
    condition: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut open = self.state.open.lock();
        *open = true;
        self.state.condition.notify_all();
    }

    fn wait(&self) {
        let mut open = self.state.open.lock();
        self.state.condition.wait_while(&mut open, |open| !*open);
    }
}

/// Mock segmentation model for tests.
///
/// Returns a category mask where pixel `(x, y)` has class `x % 3`.
#[derive(Clone)]
pub struct MockSegmentationModel {
    pub image_size: u32,
    delay: Option<Duration>,
    gate: Option<Gate>,
    fail: bool,
    calls: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl MockSegmentationModel {
    pub fn new(image_size: u32) -> Self {
        Self {
            image_size,
            delay: None,
            gate: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Calls started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end, including ones whose result was discarded.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn stripes(size: u32) -> Vec<u8> {
        (0..size * size).map(|i| ((i % size) % 3) as u8).collect()
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn run(&self, input: &InputBuffer) -> Result<OutputBuffer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.fail {
            return Err(SegmenterError::model(
                "mock inference",
                std::io::Error::new(std::io::ErrorKind::Other, "mock failure"),
            ));
        }

        Ok(OutputBuffer::Category {
            width: input.size(),
            height: input.size(),
            data: Self::stripes(input.size()),
        })
    }
}

/// Factory for a default-sized mock model.
pub fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(crate::packer::INPUT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::pack_input;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_mock_model_creation() {
        let mock = create_mock_model();
        assert_eq!(mock.input_size(), 257);
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn test_mock_model_run() -> Result<()> {
        let mock = MockSegmentationModel::new(6);
        let image = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
        let input = pack_input(&image, mock.input_size())?;

        let output = mock.run(&input)?;
        assert_eq!(output.dimensions(), (6, 6));
        assert_eq!(output.len(), 36);
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.completed(), 1);
        Ok(())
    }

    #[test]
    fn test_stripes_pattern() {
        assert_eq!(MockSegmentationModel::stripes(3), vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_gate_releases_waiters() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait())
        };
        gate.open();
        waiter.join().unwrap();
    }
}
