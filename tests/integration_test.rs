use image::{GenericImageView, Rgb, RgbImage, Rgba, RgbaImage};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use mask_overlay::{
    compositor::fit_scale,
    decode_category_mask,
    decoder::{HIGHLIGHT, TRANSPARENT},
    mocks::{Gate, MockSegmentationModel},
    pack_input, Config, ImageProcessor, InputBuffer, OutputBuffer, OverlayView, Result,
    SegmentationModel, Segmenter, SegmenterError,
};

// Model that labels every pixel as foreground.
#[derive(Debug, Clone)]
struct AllForegroundModel {
    image_size: u32,
}

impl SegmentationModel for AllForegroundModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn run(&self, input: &InputBuffer) -> Result<OutputBuffer> {
        Ok(OutputBuffer::Category {
            width: input.size(),
            height: input.size(),
            data: vec![7; (input.size() * input.size()) as usize],
        })
    }
}

#[test]
fn test_packer_length_for_model_resolution() -> Result<()> {
    for (w, h) in [(1, 1), (640, 480), (33, 900)] {
        let image = RgbImage::from_pixel(w, h, Rgb([90, 180, 30]));
        let buffer = pack_input(&image, 257)?;
        assert_eq!(buffer.len(), 257 * 257 * 3 * 4);
    }
    Ok(())
}

#[test]
fn test_decoder_scenario_and_idempotence() -> Result<()> {
    let bytes = [0u8, 1, 2, 0, 1, 2, 0, 1, 2];
    let first = decode_category_mask(&bytes, 3, 3)?;
    let second = decode_category_mask(&bytes, 3, 3)?;

    assert_eq!(first, second);
    assert_eq!(first.pixels().len(), bytes.len());
    for i in [0, 3, 6] {
        assert_eq!(first.pixels()[i], TRANSPARENT);
    }
    for i in [1, 2, 4, 5, 7, 8] {
        assert_eq!(first.pixels()[i], HIGHLIGHT);
    }
    Ok(())
}

#[test]
fn test_fit_touches_viewport_edge() {
    for (w, h) in [(257, 257), (512, 341), (100, 900)] {
        for (vw, vh) in [(1080, 1920), (300, 300), (17, 5)] {
            let size = fit_scale(w, h, vw, vh).unwrap();
            assert!(size.width <= vw && size.height <= vh);
            assert!(size.width == vw || size.height == vh);
        }
    }
}

#[tokio::test]
async fn test_cancelled_request_never_reaches_surface() -> Result<()> {
    let gate = Gate::new();
    let model = MockSegmentationModel::new(16).with_gate(gate.clone());
    let mut segmenter = Segmenter::new(model.clone());
    let mut surface = OverlayView::new(64, 64);

    let handle = segmenter.submit(RgbaImage::from_pixel(64, 64, Rgba([1, 2, 3, 255])))?;
    while model.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.cancel();
    gate.open();

    let result = segmenter.complete(handle, &mut surface).await;
    assert!(matches!(result, Err(SegmenterError::Cancelled)));
    assert_eq!(surface.update_count(), 0);

    segmenter.shutdown().await;
    assert_eq!(surface.update_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_process_directory_writes_masked_images() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");
    fs::create_dir_all(input_dir.join("nested"))?;

    RgbImage::from_pixel(1024, 512, Rgb([200, 10, 10])).save(input_dir.join("wide.png"))?;
    RgbImage::from_pixel(64, 64, Rgb([10, 200, 10])).save(input_dir.join("nested/small.png"))?;
    fs::write(input_dir.join("notes.txt"), b"not an image")?;

    let mut config = Config::for_paths(&input_dir, &output_dir);
    config.save_mask = true;
    let mut processor = ImageProcessor::new(AllForegroundModel { image_size: 32 }, config);

    let processed = processor.process().await?;
    assert_eq!(processed, 2);

    // scaled down to 512 wide; the square mask covers the left 256 columns
    let wide = image::open(output_dir.join("wide.png"))?;
    assert_eq!(wide.dimensions(), (512, 256));
    assert_eq!(wide.get_pixel(10, 10), Rgba([200, 10, 10, 255]));
    assert_eq!(wide.get_pixel(300, 10)[3], 0);
    assert!(output_dir.join("wide_mask.png").exists());

    let small = image::open(output_dir.join("nested/small.png"))?;
    assert_eq!(small.dimensions(), (64, 64));
    Ok(())
}

#[tokio::test]
async fn test_viewport_wider_than_image_leaves_margin_transparent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input_file = temp_dir.path().join("square.png");
    RgbImage::from_pixel(40, 40, Rgb([5, 6, 7])).save(&input_file)?;

    let mut config = Config::for_paths(&input_file, temp_dir.path().join("out"));
    config.viewport_width = Some(80);
    let mut processor = ImageProcessor::new(AllForegroundModel { image_size: 8 }, config);

    assert_eq!(processor.process().await?, 1);

    let result = image::open(temp_dir.path().join("out/square.png"))?;
    assert_eq!(result.dimensions(), (80, 40));
    assert_eq!(result.get_pixel(39, 39)[3], 255);
    assert_eq!(result.get_pixel(41, 0)[3], 0);
    Ok(())
}
