use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;

use crate::model::{ChannelOrder, Delegate, ModelKind, ModelOptions};

/// Longest image side fed to the segmenter; wider images are scaled down.
pub const INPUT_IMAGE_MAX_WIDTH: u32 = 512;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image file or directory of images
    pub input: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Model file. Defaults to `models/<file name of --model>`
    #[arg(short, long)]
    pub model_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModelKind::Deeplabv3)]
    pub model: ModelKind,

    #[arg(short, long, value_enum, default_value_t = Delegate::Cpu)]
    pub delegate: Delegate,

    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value_t = 2)]
    pub num_threads: usize,

    #[arg(long, value_enum, default_value_t = ChannelOrder::Last)]
    pub channel_order: ChannelOrder,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(long, default_value_t = INPUT_IMAGE_MAX_WIDTH)]
    pub max_width: u32,

    /// Viewport width. Defaults to the scaled image width
    #[arg(long)]
    pub viewport_width: Option<u32>,

    /// Viewport height. Defaults to the scaled image height
    #[arg(long)]
    pub viewport_height: Option<u32>,

    /// Also write the decoded mask next to each output image
    #[arg(long)]
    pub save_mask: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    /// Config with defaults for everything but the paths.
    pub fn for_paths(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            model_path: None,
            model: ModelKind::Deeplabv3,
            delegate: Delegate::Cpu,
            device_id: 0,
            num_threads: 2,
            channel_order: ChannelOrder::Last,
            format: "png".to_string(),
            max_width: INPUT_IMAGE_MAX_WIDTH,
            viewport_width: None,
            viewport_height: None,
            save_mask: false,
            verbose: false,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("models").join(self.model.file_name()))
    }

    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            model_path: self.model_path(),
            delegate: self.delegate,
            device_id: self.device_id,
            num_threads: self.num_threads,
            channel_order: self.channel_order,
        }
    }

    /// Explicit viewport dimensions, falling back to the image's own size.
    pub fn viewport_for(&self, width: u32, height: u32) -> (u32, u32) {
        (
            self.viewport_width.unwrap_or(width),
            self.viewport_height.unwrap_or(height),
        )
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
