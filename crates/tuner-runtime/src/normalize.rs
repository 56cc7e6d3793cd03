use std::io::Cursor;
use std::str::FromStr;

use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType as ImageFilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use thiserror::Error;
use tracing::{debug, warn};

use tuner_core::selection::SelectedFile;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeBackend {
    #[default]
    FastImageResize,
    Image,
}

impl ResizeBackend {
    /// Reads `TUNER_RESIZE_BACKEND` (`fast` | `image`), defaulting to `fast`.
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("TUNER_RESIZE_BACKEND").unwrap_or_else(|_| "fast".to_string());
        raw.parse().map_err(|_| {
            anyhow::anyhow!("invalid TUNER_RESIZE_BACKEND={raw:?} (expected: fast|image)")
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ResizeBackend::FastImageResize => "fast",
            ResizeBackend::Image => "image",
        }
    }
}

impl FromStr for ResizeBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "fast" | "fir" | "fast_image_resize" => Ok(ResizeBackend::FastImageResize),
            "image" => Ok(ResizeBackend::Image),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("reading image header failed: {0}")]
    Header(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] image::ImageError),
    #[error("resize buffer error: {0}")]
    Buffer(#[from] fast_image_resize::ImageBufferError),
    #[error("resize failed: {0}")]
    Resize(#[from] fast_image_resize::ResizeError),
    #[error("resized buffer does not match {width}x{height}")]
    ShapeMismatch { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    NotAnImage,
    WithinBudget,
    Resized { from: (u32, u32), to: (u32, u32) },
    /// Resizing failed and the original bytes were kept.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub file: SelectedFile,
    pub outcome: NormalizeOutcome,
}

/// Downscales `file` so that `width * height <= max_pixels`.
///
/// Files that are not images, or already fit, come back untouched. Any decode,
/// resize or encode failure is logged and the original is returned.
pub fn ensure_max_resolution(
    file: SelectedFile,
    max_pixels: u64,
    backend: ResizeBackend,
) -> Normalized {
    if !file.is_image() {
        return Normalized {
            file,
            outcome: NormalizeOutcome::NotAnImage,
        };
    }

    match try_normalize(&file, max_pixels, backend) {
        Ok(None) => Normalized {
            file,
            outcome: NormalizeOutcome::WithinBudget,
        },
        Ok(Some((resized, from, to))) => {
            debug!(
                name = %file.name,
                from_w = from.0,
                from_h = from.1,
                to_w = to.0,
                to_h = to.1,
                backend = backend.name(),
                "downscaled image"
            );
            Normalized {
                file: resized,
                outcome: NormalizeOutcome::Resized { from, to },
            }
        }
        Err(err) => {
            warn!(name = %file.name, error = %err, "resize failed; keeping original");
            Normalized {
                file,
                outcome: NormalizeOutcome::Fallback,
            }
        }
    }
}

type Resized = (SelectedFile, (u32, u32), (u32, u32));

fn try_normalize(
    file: &SelectedFile,
    max_pixels: u64,
    backend: ResizeBackend,
) -> Result<Option<Resized>, NormalizeError> {
    let reader = ImageReader::new(Cursor::new(file.bytes.as_slice())).with_guessed_format()?;
    let sniffed = reader.format();
    let (width, height) = reader.into_dimensions()?;
    if u64::from(width) * u64::from(height) <= max_pixels {
        return Ok(None);
    }

    let (tw, th) = target_dimensions(width, height, max_pixels);
    let decoded = ImageReader::new(Cursor::new(file.bytes.as_slice()))
        .with_guessed_format()?
        .decode()?;
    let resized = match backend {
        ResizeBackend::FastImageResize => resize_fast(decoded, tw, th)?,
        ResizeBackend::Image => decoded.resize_exact(tw, th, ImageFilterType::Lanczos3),
    };

    let format = output_format(file.content_type.as_deref(), sniffed);
    let bytes = encode(&resized, format)?;
    let out = SelectedFile::new(
        file.name.clone(),
        file.last_modified_unix_time_ms,
        Some(mime_for(format).to_string()),
        bytes,
    );
    Ok(Some((out, (width, height), (tw, th))))
}

/// Largest aspect-preserving size within `budget` pixels.
///
/// Dimensions are rounded to the nearest integer; if that pushes the product over
/// the budget the floored dimensions are used instead. Neither side drops below 1,
/// so very thin images get their long side clamped to keep the product in budget.
pub fn target_dimensions(width: u32, height: u32, budget: u64) -> (u32, u32) {
    let pixels = f64::from(width) * f64::from(height);
    let scale = (budget as f64 / pixels).sqrt();
    let w = f64::from(width) * scale;
    let h = f64::from(height) * scale;

    let rounded = ((w.round() as u32).max(1), (h.round() as u32).max(1));
    if u64::from(rounded.0) * u64::from(rounded.1) <= budget {
        return rounded;
    }
    let (fw, fh) = ((w.floor() as u32).max(1), (h.floor() as u32).max(1));
    let clamp = |side: u32, other: u32| -> u32 {
        let room = (budget / u64::from(other)).max(1);
        u32::try_from(room).map_or(side, |room| side.min(room))
    };
    (clamp(fw, fh), clamp(fh, fw))
}

fn resize_fast(src: DynamicImage, width: u32, height: u32) -> Result<DynamicImage, NormalizeError> {
    let rgba = src.into_rgba8();
    let (sw, sh) = rgba.dimensions();
    let src_image = FirImage::from_vec_u8(sw, sh, rgba.into_raw(), FirPixelType::U8x4)?;
    let mut dst_image = FirImage::new(width, height, FirPixelType::U8x4);
    let options =
        FirResizeOptions::new().resize_alg(FirResizeAlg::Convolution(FirFilterType::Lanczos3));
    FirResizer::new().resize(&src_image, &mut dst_image, &options)?;
    let out = image::RgbaImage::from_raw(width, height, dst_image.into_vec())
        .ok_or(NormalizeError::ShapeMismatch { width, height })?;
    Ok(DynamicImage::ImageRgba8(out))
}

/// PNG, WEBP and JPEG inputs keep their encoding; everything else becomes JPEG.
///
/// The declared type decides; the sniffed format is only used when none was declared.
fn output_format(declared: Option<&str>, sniffed: Option<ImageFormat>) -> ImageFormat {
    let declared = declared.map(str::trim).filter(|t| !t.is_empty());
    let format = match declared {
        Some(t) => ImageFormat::from_mime_type(t.to_ascii_lowercase()),
        None => sniffed,
    };
    match format {
        Some(f @ (ImageFormat::Png | ImageFormat::WebP | ImageFormat::Jpeg)) => f,
        _ => ImageFormat::Jpeg,
    }
}

fn mime_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::WebP => "image/webp",
        _ => "image/jpeg",
    }
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, NormalizeError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Png => img.write_with_encoder(PngEncoder::new(&mut buf))?,
        // The webp encoder is lossless only.
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut buf))?,
        _ => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?,
    }
    Ok(buf)
}
