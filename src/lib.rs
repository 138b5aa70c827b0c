pub mod compositor;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod mocks;
pub mod model;
pub mod packer;
pub mod session;
pub mod surface;
pub mod traits;

use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use config::Config;
pub use decoder::{decode_category_mask, Mask, MaskDecoder, OutputBuffer};
pub use errors::{Result, SegmenterError};
pub use model::{Delegate, ModelKind, OnnxSegmenter};
pub use packer::{pack_input, InputBuffer};
pub use session::{RequestState, Segmentation, Segmenter};
pub use surface::OverlayView;
pub use traits::*;

/// Shrink `image` to `max_width` keeping its aspect ratio. Narrower images are
/// returned unchanged.
pub fn scale_down(image: &DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if max_width == 0 || max_width >= width {
        return image.clone();
    }
    let aspect_ratio = width as f32 / height as f32;
    let target_height = ((max_width as f32 / aspect_ratio) as u32).max(1);
    image.resize_exact(max_width, target_height, FilterType::Triangle)
}

/// Runs files through a [`Segmenter`] one at a time and writes the masked
/// images out.
pub struct ImageProcessor<M: SegmentationModel> {
    segmenter: Segmenter<M>,
    config: Config,
}

impl<M: SegmentationModel + 'static> ImageProcessor<M> {
    pub fn new(model: M, config: Config) -> Self {
        Self {
            segmenter: Segmenter::new(model),
            config,
        }
    }

    pub fn segmenter(&self) -> &Segmenter<M> {
        &self.segmenter
    }

    pub async fn process(&mut self) -> Result<usize> {
        let input = self.config.input.clone();
        if input.is_file() {
            let output_dir = self.config.output_dir.clone();
            self.process_single_image(&input, &output_dir).await?;
            Ok(1)
        } else {
            self.process_directory().await
        }
    }

    pub async fn process_directory(&mut self) -> Result<usize> {
        let input_path = self.config.input.clone();
        let output_path = self.config.output_dir.clone();

        if !input_path.exists() {
            return Err(SegmenterError::FileSystem {
                path: input_path,
                operation: "input directory check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(&output_path).map_err(|e| SegmenterError::FileSystem {
            path: output_path.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(&input_path);
        if image_files.is_empty() {
            tracing::info!("no images found in {}", input_path.display());
            return Ok(0);
        }

        let pb = ProgressBar::new(image_files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .map_err(|e| SegmenterError::Configuration {
                    message: e.to_string(),
                })?
                .progress_chars("#>-"),
        );

        let mut processed = 0;
        for input_file in &image_files {
            let relative = self.get_relative_path(input_file)?;
            let target_dir = match relative.parent() {
                Some(parent) => output_path.join(parent),
                None => output_path.clone(),
            };
            match self.process_single_image(input_file, &target_dir).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    pb.suspend(|| tracing::error!("{}: {}", input_file.display(), e));
                }
            }
            pb.inc(1);
        }

        pb.finish_with_message("done");
        tracing::info!("segmented {}/{} images", processed, image_files.len());
        Ok(processed)
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        let mut image_files: Vec<PathBuf> = WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && self.is_supported_image_format(path))
            .collect();
        image_files.sort();
        image_files
    }

    pub fn is_supported_image_format(&self, path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(
                extension.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff"
            )
        } else {
            false
        }
    }

    pub async fn process_single_image(&mut self, input_file: &Path, output_dir: &Path) -> Result<()> {
        let img = image::open(input_file).map_err(|e| SegmenterError::ImageProcessing {
            path: input_file.display().to_string(),
            operation: "image loading".to_string(),
            source: Box::new(e),
        })?;

        let base = scale_down(&img, self.config.max_width).into_rgba8();
        let (width, height) = base.dimensions();
        let (vw, vh) = self.config.viewport_for(width, height);
        let mut surface = OverlayView::new(vw, vh);

        let segmentation = self
            .segmenter
            .segment(base, &mut surface)
            .await
            .map_err(|e| SegmenterError::ImageProcessing {
                path: input_file.display().to_string(),
                operation: "segmentation".to_string(),
                source: Box::new(e),
            })?;

        let Some(composited) = segmentation.composited else {
            tracing::warn!(
                "{}: empty viewport {}x{}, nothing to write",
                input_file.display(),
                vw,
                vh
            );
            return Ok(());
        };

        fs::create_dir_all(output_dir).map_err(|e| SegmenterError::FileSystem {
            path: output_dir.to_path_buf(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let stem = input_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let output_file = output_dir.join(&stem).with_extension(&self.config.format);
        self.save(composited, &output_file)?;

        if self.config.save_mask {
            let mask_file = output_dir.join(format!("{}_mask.png", stem));
            self.save(segmentation.mask.to_rgba_image(), &mask_file)?;
        }

        tracing::debug!("wrote {}", output_file.display());
        Ok(())
    }

    fn save(&self, image: RgbaImage, path: &Path) -> Result<()> {
        let format = if path.extension().is_some_and(|ext| ext == "png") {
            ImageFormat::Png
        } else {
            self.config.output_format()
        };
        let image = DynamicImage::ImageRgba8(image);
        // JPEG has no alpha channel
        let image = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
            _ => image,
        };
        image
            .save_with_format(path, format)
            .map_err(|e| SegmenterError::ImageProcessing {
                path: path.display().to_string(),
                operation: "image saving".to_string(),
                source: Box::new(e),
            })
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input_dir = &self.config.input;
        input_file
            .strip_prefix(input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| SegmenterError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is not inside the input directory",
                ),
            })
    }

    /// Cancel in-flight work and release the model.
    pub async fn shutdown(&mut self) {
        self.segmenter.shutdown().await;
    }
}

impl ImageProcessor<OnnxSegmenter> {
    pub fn with_onnx_model(config: Config) -> Result<Self> {
        let model = OnnxSegmenter::load(&config.model_options())?;
        Ok(Self::new(model, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSegmentationModel;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_scale_down_keeps_aspect() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1024, 768, Rgb([1, 2, 3])));
        let scaled = scale_down(&image, 512);
        assert_eq!((scaled.width(), scaled.height()), (512, 384));

        let small = DynamicImage::ImageRgb8(RgbImage::new(300, 200));
        let unchanged = scale_down(&small, 512);
        assert_eq!((unchanged.width(), unchanged.height()), (300, 200));
    }

    #[test]
    fn test_supported_formats() {
        let processor = ImageProcessor::new(
            MockSegmentationModel::new(8),
            Config::for_paths("input", "output"),
        );

        let test_cases = vec![
            ("test.jpg", true),
            ("test.JPEG", true),
            ("test.png", true),
            ("test.webp", true),
            ("test.txt", false),
            ("test", false),
        ];
        for (filename, expected) in test_cases {
            assert_eq!(
                processor.is_supported_image_format(Path::new(filename)),
                expected,
                "{}",
                filename
            );
        }
    }

    #[test]
    fn test_relative_path_calculation() -> Result<()> {
        use tempfile::TempDir;

        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let subdir = input_dir.join("subdir");
        fs::create_dir_all(&subdir)?;

        let processor = ImageProcessor::new(
            MockSegmentationModel::new(8),
            Config::for_paths(&input_dir, "output"),
        );

        let relative = processor.get_relative_path(&subdir.join("test.jpg"))?;
        assert_eq!(relative, Path::new("subdir/test.jpg"));
        assert!(processor
            .get_relative_path(Path::new("/elsewhere/test.jpg"))
            .is_err());
        Ok(())
    }
}
