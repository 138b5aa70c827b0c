use std::{fmt, path::Path, path::PathBuf};

use clap::ValueEnum;
use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    tensor::TensorElementType,
    value::TensorRef,
};
use parking_lot::Mutex;

use crate::{
    decoder::{category_mask_from_logits, OutputBuffer},
    errors::{Result, SegmenterError},
    packer::{InputBuffer, INPUT_SIZE},
    traits::SegmentationModel,
};

/// Hardware backend used to run the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum Delegate {
    #[default]
    Cpu,
    /// CUDA execution provider.
    Gpu,
    /// Dedicated accelerator slot, backed by TensorRT.
    Nnapi,
}

impl fmt::Display for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Nnapi => "nnapi",
        })
    }
}

impl Delegate {
    fn execution_provider(self, device_id: i32) -> Option<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => None,
            Self::Gpu => Some(
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ),
            Self::Nnapi => Some(
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ),
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Gpu => CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
            Self::Nnapi => TensorRTExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
        }
    }

    /// `UnsupportedAccelerator` unless the backend can run on this machine.
    pub fn ensure_available(self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SegmenterError::UnsupportedAccelerator { requested: self })
        }
    }
}

/// Pick the delegate to load with. Returns the delegate in use and, when it
/// had to fall back to the CPU, the one that was requested.
pub fn select_delegate(
    requested: Delegate,
    available: impl Fn(Delegate) -> bool,
) -> (Delegate, Option<Delegate>) {
    if available(requested) {
        return (requested, None);
    }
    tracing::warn!(
        "{}, falling back to {}",
        SegmenterError::UnsupportedAccelerator { requested },
        Delegate::Cpu
    );
    (Delegate::Cpu, Some(requested))
}

/// Bundled segmentation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModelKind {
    #[default]
    Deeplabv3,
    HairSegmenter,
    SelfieSegmenter,
    SelfieMulticlass,
}

impl ModelKind {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Deeplabv3 => "deeplabv3.onnx",
            Self::HairSegmenter => "hair_segmenter.onnx",
            Self::SelfieSegmenter => "selfie_segmenter.onnx",
            Self::SelfieMulticlass => "selfie_multiclass.onnx",
        }
    }
}

/// Where the channel axis sits in the model's tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ChannelOrder {
    /// NHWC, as TFLite-converted models use.
    #[default]
    Last,
    /// NCHW, as PyTorch exports use.
    First,
}

#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub model_path: PathBuf,
    pub delegate: Delegate,
    pub device_id: i32,
    pub num_threads: usize,
    pub channel_order: ChannelOrder,
}

impl ModelOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            delegate: Delegate::Cpu,
            device_id: 0,
            num_threads: 2,
            channel_order: ChannelOrder::Last,
        }
    }
}

/// ONNX Runtime backed segmentation model.
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    output_is_u8: bool,
    input_size: u32,
    channel_order: ChannelOrder,
    delegate: Delegate,
    fallback_from: Option<Delegate>,
}

impl OnnxSegmenter {
    /// Load the model once. An unavailable delegate falls back to the CPU; the
    /// caller can see that through [`OnnxSegmenter::fallback_from`].
    pub fn load(options: &ModelOptions) -> Result<Self> {
        let (delegate, fallback_from) = select_delegate(options.delegate, Delegate::is_available);

        let path = options.model_path.as_path();
        if !path.is_file() {
            return Err(SegmenterError::ModelLoad {
                path: path.to_path_buf(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "model file does not exist",
                )),
            });
        }

        let mut session = build_session(path, delegate, options)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| load_error(path, "model has no inputs"))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| load_error(path, "model has no outputs"))?;
        let input_name = input.name.clone();
        let output_name = output.name.clone();
        let output_is_u8 = output.output_type.tensor_type() == Some(TensorElementType::Uint8);

        let spatial_axis = match options.channel_order {
            ChannelOrder::Last => 1,
            ChannelOrder::First => 2,
        };
        let input_size = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(spatial_axis).copied())
            .filter(|&d| d > 0)
            .map_or(INPUT_SIZE, |d| d as u32);

        // initialize model
        let size = input_size as usize;
        let warmup = match options.channel_order {
            ChannelOrder::Last => Array4::<f32>::zeros((1, size, size, 3)),
            ChannelOrder::First => Array4::<f32>::zeros((1, 3, size, size)),
        };
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&warmup)?])
            .map_err(|e| load_error(path, e))?;

        tracing::info!(
            "loaded {} ({}x{} input, delegate {})",
            path.display(),
            input_size,
            input_size,
            delegate
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            output_is_u8,
            input_size,
            channel_order: options.channel_order,
            delegate,
            fallback_from,
        })
    }

    pub const fn delegate(&self) -> Delegate {
        self.delegate
    }

    /// The delegate that was requested but unavailable, if any.
    pub const fn fallback_from(&self) -> Option<Delegate> {
        self.fallback_from
    }
}

fn load_error(path: &Path, err: impl fmt::Display) -> SegmenterError {
    SegmenterError::ModelLoad {
        path: path.to_path_buf(),
        source: err.to_string().into(),
    }
}

fn build_session(path: &Path, delegate: Delegate, options: &ModelOptions) -> Result<Session> {
    let builder = SessionBuilder::new().map_err(|e| load_error(path, e))?;
    let builder = match delegate.execution_provider(options.device_id) {
        Some(provider) => builder
            .with_execution_providers([provider])
            .map_err(|e| load_error(path, e))?,
        None => builder,
    };
    builder
        .with_intra_threads(options.num_threads.max(1))
        .map_err(|e| load_error(path, e))?
        .with_memory_pattern(true)
        .map_err(|e| load_error(path, e))?
        .commit_from_file(path)
        .map_err(|e| load_error(path, e))
}

impl SegmentationModel for OnnxSegmenter {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn run(&self, input: &InputBuffer) -> Result<OutputBuffer> {
        if input.size() != self.input_size {
            return Err(SegmenterError::InvalidBufferSize {
                buffer: "input",
                expected: InputBuffer::expected_len(self.input_size),
                actual: input.len(),
            });
        }

        let tensor = input.to_tensor()?;
        let tensor = match self.channel_order {
            ChannelOrder::Last => tensor,
            ChannelOrder::First => tensor
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        };

        let mut session = self.session.lock();
        let outputs = session.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor)?],
        )?;
        let value = &outputs[self.output_name.as_str()];

        if self.output_is_u8 {
            let classes = value.try_extract_array::<u8>()?;
            return category_output(classes.view());
        }
        let scores = value.try_extract_array::<f32>()?;
        interpret_scores(scores.view(), self.channel_order)
    }
}

/// Drop unit batch and channel axes until only `(H, W)` is left.
fn plane_dims(shape: &[usize]) -> Option<(usize, usize)> {
    let mut dims = shape;
    while dims.len() > 2 && dims[0] == 1 {
        dims = &dims[1..];
    }
    while dims.len() > 2 && dims[dims.len() - 1] == 1 {
        dims = &dims[..dims.len() - 1];
    }
    match *dims {
        [height, width] => Some((height, width)),
        _ => None,
    }
}

/// `(H, W, C)` of a float output, reading the channel axis from `order`.
/// A rank-4 output must have a batch of one.
fn score_dims(shape: &[usize], order: ChannelOrder) -> Option<(usize, usize, usize)> {
    let dims = match *shape {
        [1, ..] if shape.len() == 4 => &shape[1..],
        [_, _, _] => shape,
        [height, width] => return Some((height, width, 1)),
        _ => return None,
    };
    Some(match order {
        ChannelOrder::Last => (dims[0], dims[1], dims[2]),
        ChannelOrder::First => (dims[1], dims[2], dims[0]),
    })
}

/// A `u8` output is already one class index per pixel.
pub fn category_output(classes: ArrayViewD<u8>) -> Result<OutputBuffer> {
    let (height, width) =
        plane_dims(classes.shape()).ok_or_else(|| unexpected_shape(classes.shape()))?;
    Ok(OutputBuffer::Category {
        width: width as u32,
        height: height as u32,
        data: classes.iter().copied().collect(),
    })
}

/// Float output: a single channel is a confidence mask, several channels are
/// per-class logits reduced with argmax.
pub fn interpret_scores(scores: ArrayViewD<f32>, order: ChannelOrder) -> Result<OutputBuffer> {
    let shape = scores.shape().to_vec();
    let (height, width, channels) =
        score_dims(&shape, order).ok_or_else(|| unexpected_shape(&shape))?;

    if channels == 1 {
        return Ok(OutputBuffer::Confidence {
            width: width as u32,
            height: height as u32,
            data: scores.iter().copied().collect(),
        });
    }

    let scores = match shape.len() {
        4 => scores.index_axis_move(Axis(0), 0),
        _ => scores,
    };
    let scores = scores.into_dimensionality::<Ix3>()?;
    let hwc = match order {
        ChannelOrder::Last => scores,
        ChannelOrder::First => scores.permuted_axes([1, 2, 0]),
    };

    Ok(OutputBuffer::Category {
        width: width as u32,
        height: height as u32,
        data: category_mask_from_logits(hwc),
    })
}

fn unexpected_shape(shape: &[usize]) -> SegmenterError {
    SegmenterError::Validation {
        field: "model output".to_string(),
        reason: format!("has unsupported shape {:?}", shape),
    }
}
