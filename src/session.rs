//! Segmentation request lifecycle.
//!
//! One request may be in flight per surface. Packing and inference run on the
//! blocking pool; decoding and compositing run on the task that owns the
//! surface, after the result comes back over a one-shot channel.

use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::compositor::apply_overlay;
use crate::decoder::{Mask, MaskDecoder, OutputBuffer};
use crate::errors::{Result, SegmenterError};
use crate::packer::pack_input;
use crate::traits::{DisplaySurface, SegmentationModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Loading,
    Inferring,
    Decoding,
    Compositing,
    Done,
    Error,
    Cancelled,
}

impl RequestState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
struct StateCell {
    id: u64,
    state: Arc<Mutex<RequestState>>,
}

impl StateCell {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(RequestState::Idle)),
        }
    }

    fn get(&self) -> RequestState {
        *self.state.lock()
    }

    /// Terminal states are sticky.
    fn set(&self, next: RequestState) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        tracing::debug!("request {}: {:?} -> {:?}", self.id, *state, next);
        *state = next;
    }
}

/// Result of a completed request.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub mask: Mask,
    /// The base image masked by the overlay. `None` when the viewport or mask
    /// has a zero dimension and compositing was skipped.
    pub composited: Option<RgbaImage>,
}

/// A submitted request. Hand it back to [`Segmenter::complete`].
pub struct RequestHandle {
    state: StateCell,
    token: CancellationToken,
    image: Arc<RgbaImage>,
    receiver: oneshot::Receiver<Result<OutputBuffer>>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owns the model handle and the single in-flight request.
///
/// The model handle is replaced explicitly: in-flight work is cancelled and
/// drained before the old model is released.
pub struct Segmenter<M: SegmentationModel> {
    model: Option<Arc<M>>,
    decoder: MaskDecoder,
    tracker: TaskTracker,
    current: Option<(u64, CancellationToken)>,
    next_id: u64,
}

impl<M: SegmentationModel + 'static> Segmenter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Some(Arc::new(model)),
            decoder: MaskDecoder::default(),
            tracker: TaskTracker::new(),
            current: None,
            next_id: 0,
        }
    }

    pub fn with_decoder(mut self, decoder: MaskDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn model(&self) -> Option<&Arc<M>> {
        self.model.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.model.is_none()
    }

    pub fn has_in_flight(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|(_, token)| !token.is_cancelled())
    }

    /// Start a request, cancelling the one in flight first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&mut self, image: impl Into<Arc<RgbaImage>>) -> Result<RequestHandle> {
        self.cancel();

        let model = self
            .model
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SegmenterError::Configuration {
                message: "segmenter is closed".to_string(),
            })?;

        let id = self.next_id;
        self.next_id += 1;
        let state = StateCell::new(id);
        let token = CancellationToken::new();
        let image = image.into();

        state.set(RequestState::Loading);
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            state.set(RequestState::Error);
            return Err(SegmenterError::InvalidImage { width, height });
        }

        let (sender, receiver) = oneshot::channel();
        {
            let state = state.clone();
            let token = token.clone();
            let image = Arc::clone(&image);
            self.tracker.spawn_blocking(move || {
                if token.is_cancelled() {
                    return;
                }
                state.set(RequestState::Inferring);
                let result =
                    pack_input(&*image, model.input_size()).and_then(|input| model.run(&input));

                // The native call cannot be interrupted; a late result is dropped.
                if token.is_cancelled() {
                    tracing::debug!("request {}: discarding result of cancelled inference", id);
                    return;
                }
                let _ = sender.send(result);
            });
        }

        self.current = Some((id, token.clone()));
        Ok(RequestHandle {
            state,
            token,
            image,
            receiver,
        })
    }

    /// Wait for `handle`, then decode and composite on the caller's task.
    ///
    /// A cancelled request returns `Cancelled` without touching `surface`. A
    /// failed request clears `surface` and returns the error once.
    pub async fn complete<S: DisplaySurface>(
        &mut self,
        handle: RequestHandle,
        surface: &mut S,
    ) -> Result<Segmentation> {
        let RequestHandle {
            state,
            token,
            image,
            receiver,
        } = handle;

        let received = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = receiver => result.ok(),
        };

        let result = match received {
            _ if token.is_cancelled() => {
                self.finish(state.id);
                state.set(RequestState::Cancelled);
                return Err(SegmenterError::Cancelled);
            }
            Some(result) => result,
            None => Err(SegmenterError::Model {
                operation: "inference task".to_string(),
                source: "worker exited without a result".into(),
            }),
        };

        let outcome = result.and_then(|output| {
            state.set(RequestState::Decoding);
            let mask = self.decoder.decode(&output)?;

            state.set(RequestState::Compositing);
            surface.set_mask(&mask);
            let composited = apply_overlay(&image, &mask, surface.viewport());
            Ok(Segmentation { mask, composited })
        });

        self.finish(state.id);
        match outcome {
            Ok(segmentation) => {
                state.set(RequestState::Done);
                Ok(segmentation)
            }
            Err(err) => {
                tracing::warn!("request {} failed: {}", state.id, err);
                state.set(RequestState::Error);
                surface.clear();
                Err(err)
            }
        }
    }

    /// Submit and complete in one go.
    pub async fn segment<S: DisplaySurface>(
        &mut self,
        image: impl Into<Arc<RgbaImage>>,
        surface: &mut S,
    ) -> Result<Segmentation> {
        let handle = self.submit(image)?;
        self.complete(handle, surface).await
    }

    /// Cancel the in-flight request, if any.
    pub fn cancel(&mut self) {
        if let Some((id, token)) = self.current.take() {
            if !token.is_cancelled() {
                tracing::debug!("cancelling request {}", id);
                token.cancel();
            }
        }
    }

    /// Cancel in-flight work and wait for the worker to let go of the model.
    async fn drain(&mut self) {
        self.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Swap the model, e.g. after a delegate or model change.
    pub async fn replace_model(&mut self, model: M) {
        self.drain().await;
        self.model = Some(Arc::new(model));
    }

    /// Release the model. The segmenter is unusable until `replace_model`.
    pub async fn shutdown(&mut self) {
        self.drain().await;
        self.model = None;
    }

    fn finish(&mut self, id: u64) {
        if matches!(self.current, Some((current, _)) if current == id) {
            self.current = None;
        }
    }
}
