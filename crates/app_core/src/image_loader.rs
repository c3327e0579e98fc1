//! Image decoding
//!
//! GIFs decode to a frame sequence with per-frame delays; every other format
//! decodes to a single image with its EXIF orientation applied.

use crate::{CoreError, Result};
use app_db::{ImageKind, ImageMetadata};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader, RgbaImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delay used for frames that declare none
const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(100);

/// One frame of an animation
#[derive(Debug, Clone)]
pub struct AnimationFrame {
    pub image: RgbaImage,
    pub delay: Duration,
}

/// A decoded image ready for display
#[derive(Debug, Clone)]
pub enum DecodedImage {
    Static {
        path: PathBuf,
        image: DynamicImage,
    },
    Animated {
        path: PathBuf,
        frames: Vec<AnimationFrame>,
        width: u32,
        height: u32,
    },
}

impl DecodedImage {
    pub fn path(&self) -> &Path {
        match self {
            DecodedImage::Static { path, .. } | DecodedImage::Animated { path, .. } => path,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DecodedImage::Static { image, .. } => image.dimensions(),
            DecodedImage::Animated { width, height, .. } => (*width, *height),
        }
    }

    pub fn kind(&self) -> ImageKind {
        match self {
            DecodedImage::Static { .. } => ImageKind::Static,
            DecodedImage::Animated { .. } => ImageKind::Animated,
        }
    }

    pub fn frame_count(&self) -> usize {
        match self {
            DecodedImage::Static { .. } => 1,
            DecodedImage::Animated { frames, .. } => frames.len(),
        }
    }

    /// Iterate frames with their display delay. A static image yields one
    /// frame with a zero delay.
    pub fn frames(&self) -> Box<dyn Iterator<Item = (RgbaImage, Duration)> + '_> {
        match self {
            DecodedImage::Static { image, .. } => Box::new(std::iter::once((image.to_rgba8(), Duration::ZERO))),
            DecodedImage::Animated { frames, .. } => {
                Box::new(frames.iter().map(|f| (f.image.clone(), f.delay)))
            }
        }
    }

    /// Metadata record for this image using the file's current size and mtime
    pub fn metadata(&self) -> Result<ImageMetadata> {
        let (width, height) = self.dimensions();
        Ok(ImageMetadata::from_file(self.path(), width, height, self.kind())?)
    }
}

/// Decode `path` on the calling thread
pub fn decode_image(path: &Path) -> Result<DecodedImage> {
    tracing::debug!("Decoding image: {}", path.display());

    let reader = ImageReader::open(path)?.with_guessed_format()?;

    match reader.format() {
        Some(ImageFormat::Gif) => decode_animated(path),
        Some(_) => decode_static(path, reader),
        None => Err(CoreError::UnsupportedFormat(path.display().to_string())),
    }
}

fn decode_static(path: &Path, reader: ImageReader<BufReader<File>>) -> Result<DecodedImage> {
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CoreError::ImageDecode(format!("Empty image: {}", path.display())));
    }

    Ok(DecodedImage::Static {
        path: path.to_path_buf(),
        image,
    })
}

fn decode_animated(path: &Path) -> Result<DecodedImage> {
    let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
    let (width, height) = decoder.dimensions();

    let frames = decoder
        .into_frames()
        .collect_frames()?
        .into_iter()
        .map(|frame| {
            let (numer, denom) = frame.delay().numer_denom_ms();
            let millis = if denom == 0 { 0 } else { numer / denom };
            let delay = if millis == 0 {
                DEFAULT_FRAME_DELAY
            } else {
                Duration::from_millis(millis as u64)
            };
            AnimationFrame {
                image: frame.into_buffer(),
                delay,
            }
        })
        .collect::<Vec<_>>();

    if frames.is_empty() || width == 0 || height == 0 {
        return Err(CoreError::ImageDecode(format!("GIF has no frames: {}", path.display())));
    }

    Ok(DecodedImage::Animated {
        path: path.to_path_buf(),
        frames,
        width,
        height,
    })
}
