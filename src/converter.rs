//! Icon conversion: SVG/PNG sources rendered into ICO, ICNS or PNG output.

use crate::error::ConversionFailure;
use crate::format::{BitDepth, ColorSpace, ConversionOptions, IconFormat, PngOptions, MAX_OUTPUT_SIZE};
use crate::job::{ConversionArtifact, ConversionRequest};
use bytes::Bytes;
use flate2::Crc;
use image::codecs::ico::{IcoEncoder, IcoFrame};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, Rgba, RgbaImage};
use resvg::tiny_skia;
use std::io::Cursor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A CPU-bound conversion function run by the worker pool.
///
/// Implementations must be safe to call concurrently from several workers
/// and should check `cancel` between expensive steps so abandoned work stops
/// early.
#[cfg_attr(test, mockall::automock)]
pub trait ConversionRoutine: Send + Sync + 'static {
    fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionArtifact, ConversionFailure>;
}

impl<F> ConversionRoutine for F
where
    F: Fn(&ConversionRequest, &CancellationToken) -> Result<ConversionArtifact, ConversionFailure>
        + Send
        + Sync
        + 'static,
{
    fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionArtifact, ConversionFailure> {
        self(request, cancel)
    }
}

/// Frame sizes written to `.ico` files.
pub const ICO_SIZES: [u32; 7] = [16, 24, 32, 48, 64, 128, 256];

/// Frame sizes written to `.icns` files with their element type codes.
pub const ICNS_ENTRIES: [(u32, [u8; 4]); 7] = [
    (16, *b"icp4"),
    (32, *b"icp5"),
    (64, *b"icp6"),
    (128, *b"ic07"),
    (256, *b"ic08"),
    (512, *b"ic09"),
    (1024, *b"ic10"),
];

/// PNG edge used for SVG input when no output size is requested.
const DEFAULT_VECTOR_EDGE: u32 = 512;

/// Per-channel distance under which a pixel counts as background.
const BACKGROUND_TOLERANCE: u8 = 32;

const PNG_SIGNATURE_LEN: usize = 8;
const IHDR_CHUNK_LEN: usize = 25;
const INCHES_PER_METER: f64 = 39.370_078_740_157_48;

/// Decoded input, ready to be rendered at any size.
enum Source {
    Vector(usvg::Tree),
    Raster(RgbaImage),
}

impl Source {
    fn dimensions(&self) -> (f32, f32) {
        match self {
            Source::Vector(tree) => (tree.size().width(), tree.size().height()),
            Source::Raster(img) => (img.width() as f32, img.height() as f32),
        }
    }
}

/// Where the source content lands on the square canvas.
#[derive(Debug, Clone, Copy)]
struct ContentBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl ContentBox {
    fn fit(source: (f32, f32), edge: u32, scale: f32) -> (Self, f32) {
        let edge = edge as f32;
        let factor = edge * scale / source.0.max(source.1);
        let width = source.0 * factor;
        let height = source.1 * factor;
        let content = Self {
            x: (edge - width) / 2.0,
            y: (edge - height) / 2.0,
            width,
            height,
        };
        (content, factor)
    }
}

/// Converts SVG and PNG input into icon containers.
///
/// Vector input is rasterized with resvg at every target size so small
/// frames stay sharp; raster input is resampled with a Lanczos filter.
pub struct IconConverter;

impl IconConverter {
    /// Creates a new converter with default options.
    pub fn new() -> Self {
        Self
    }

    /// Runs one conversion.
    ///
    /// # Errors
    ///
    /// - Decode errors (malformed SVG/PNG, zero-sized images)
    /// - Encode errors from the output codec
    /// - [`ConversionFailure::Aborted`] once `cancel` is triggered
    pub fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionArtifact, ConversionFailure> {
        info!(
            input_format = %request.input_format,
            output_format = %request.output_format,
            input_bytes = request.input.len(),
            "Converting icon"
        );

        let source = load_source(request)?;
        let options = &request.options;

        let artifact = match request.output_format {
            IconFormat::Ico => {
                let sizes = frame_sizes(&ICO_SIZES, options.output_size);
                let data = encode_ico(&source, &sizes, options, cancel)?;
                ConversionArtifact {
                    data: Bytes::from(data),
                    format: IconFormat::Ico,
                    frame_sizes: sizes,
                }
            }
            IconFormat::Icns => {
                let all: Vec<u32> = ICNS_ENTRIES.iter().map(|(size, _)| *size).collect();
                let sizes = frame_sizes(&all, options.output_size);
                let data = encode_icns(&source, &sizes, options, cancel)?;
                ConversionArtifact {
                    data: Bytes::from(data),
                    format: IconFormat::Icns,
                    frame_sizes: sizes,
                }
            }
            IconFormat::Png => {
                let edge = options.output_size.unwrap_or_else(|| default_edge(&source));
                check_cancelled(cancel)?;
                let img = render(&source, edge, options)?;
                let data = encode_png(img, &options.png)?;
                ConversionArtifact {
                    data: Bytes::from(data),
                    format: IconFormat::Png,
                    frame_sizes: vec![edge],
                }
            }
            other => {
                return Err(ConversionFailure::Unsupported {
                    from: request.input_format,
                    to: other,
                })
            }
        };

        info!(
            output_format = %artifact.format,
            output_bytes = artifact.len(),
            frames = artifact.frame_sizes.len(),
            "Icon conversion complete"
        );
        Ok(artifact)
    }
}

impl Default for IconConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionRoutine for IconConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionArtifact, ConversionFailure> {
        IconConverter::convert(self, request, cancel)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ConversionFailure> {
    if cancel.is_cancelled() {
        Err(ConversionFailure::Aborted)
    } else {
        Ok(())
    }
}

fn load_source(request: &ConversionRequest) -> Result<Source, ConversionFailure> {
    let source = match request.input_format {
        IconFormat::Svg => {
            let tree = usvg::Tree::from_data(&request.input, &usvg::Options::default()).map_err(
                |e| ConversionFailure::Decode {
                    format: IconFormat::Svg,
                    reason: e.to_string(),
                },
            )?;
            Source::Vector(tree)
        }
        IconFormat::Png => {
            let img = image::load_from_memory_with_format(&request.input, image::ImageFormat::Png)
                .map_err(|e| ConversionFailure::Decode {
                    format: IconFormat::Png,
                    reason: e.to_string(),
                })?;
            Source::Raster(img.to_rgba8())
        }
        other => {
            return Err(ConversionFailure::Unsupported {
                from: other,
                to: request.output_format,
            })
        }
    };

    let (width, height) = source.dimensions();
    if width <= 0.0 || height <= 0.0 || !width.is_finite() || !height.is_finite() {
        return Err(ConversionFailure::InvalidDimensions { width, height });
    }
    debug!(width, height, "Source decoded");
    Ok(source)
}

fn default_edge(source: &Source) -> u32 {
    match source {
        Source::Vector(_) => DEFAULT_VECTOR_EDGE,
        Source::Raster(img) => img.width().max(img.height()).min(MAX_OUTPUT_SIZE),
    }
}

/// Keeps the standard sizes not larger than `limit`, or the smallest one.
fn frame_sizes(all: &[u32], limit: Option<u32>) -> Vec<u32> {
    let Some(limit) = limit else {
        return all.to_vec();
    };
    let kept: Vec<u32> = all.iter().copied().filter(|size| *size <= limit).collect();
    if kept.is_empty() {
        all.iter().copied().take(1).collect()
    } else {
        kept
    }
}

/// Renders the source onto a transparent `edge` x `edge` canvas.
fn render(
    source: &Source,
    edge: u32,
    options: &ConversionOptions,
) -> Result<RgbaImage, ConversionFailure> {
    let (content, factor) = ContentBox::fit(source.dimensions(), edge, options.scale);

    let mut img = match source {
        Source::Vector(tree) => {
            let mut pixmap = tiny_skia::Pixmap::new(edge, edge).ok_or_else(|| {
                ConversionFailure::Render(format!("cannot allocate {edge}x{edge} canvas"))
            })?;
            let transform =
                tiny_skia::Transform::from_scale(factor, factor).post_translate(content.x, content.y);
            resvg::render(tree, transform, &mut pixmap.as_mut());

            let mut img = RgbaImage::new(edge, edge);
            for (dst, px) in img.pixels_mut().zip(pixmap.pixels()) {
                let c = px.demultiply();
                *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
            }
            img
        }
        Source::Raster(src) => {
            let width = (content.width.round() as u32).clamp(1, edge);
            let height = (content.height.round() as u32).clamp(1, edge);
            let resized = imageops::resize(src, width, height, FilterType::Lanczos3);
            let mut canvas = RgbaImage::new(edge, edge);
            imageops::overlay(
                &mut canvas,
                &resized,
                i64::from(edge.saturating_sub(width) / 2),
                i64::from(edge.saturating_sub(height) / 2),
            );
            canvas
        }
    };

    if options.remove_background {
        remove_background(&mut img, content);
    }
    if options.corner_radius > 0.0 {
        round_corners(&mut img, content, options.corner_radius);
    }
    Ok(img)
}

/// Clears every pixel close to the opaque colour at the content's top-left.
fn remove_background(img: &mut RgbaImage, content: ContentBox) {
    let key_x = (content.x.ceil() as u32).min(img.width().saturating_sub(1));
    let key_y = (content.y.ceil() as u32).min(img.height().saturating_sub(1));
    let key = *img.get_pixel(key_x, key_y);
    if key[3] < u8::MAX {
        return;
    }

    for px in img.pixels_mut() {
        let close = px[3] > 0
            && px.0[..3]
                .iter()
                .zip(&key.0[..3])
                .all(|(a, b)| a.abs_diff(*b) <= BACKGROUND_TOLERANCE);
        if close {
            *px = Rgba([0, 0, 0, 0]);
        }
    }
}

/// Applies an anti-aliased rounded-rectangle mask to the content box.
fn round_corners(img: &mut RgbaImage, content: ContentBox, fraction: f32) {
    let radius = fraction * content.width.min(content.height);
    if radius < 0.5 {
        return;
    }
    let left = content.x;
    let top = content.y;
    let right = content.x + content.width;
    let bottom = content.y + content.height;

    for (x, y, px) in img.enumerate_pixels_mut() {
        let cx = x as f32 + 0.5;
        let cy = y as f32 + 0.5;
        let nearest_x = cx.clamp(left + radius, right - radius);
        let nearest_y = cy.clamp(top + radius, bottom - radius);
        let dx = cx - nearest_x;
        let dy = cy - nearest_y;
        if dx == 0.0 || dy == 0.0 {
            continue;
        }
        let distance = (dx * dx + dy * dy).sqrt();
        let coverage = (radius - distance + 0.5).clamp(0.0, 1.0);
        px[3] = (f32::from(px[3]) * coverage).round() as u8;
    }
}

fn encode_failure(format: IconFormat) -> impl Fn(image::ImageError) -> ConversionFailure {
    move |e| ConversionFailure::Encode {
        format,
        reason: e.to_string(),
    }
}

fn encode_ico(
    source: &Source,
    sizes: &[u32],
    options: &ConversionOptions,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ConversionFailure> {
    let mut frames = Vec::with_capacity(sizes.len());
    for &edge in sizes {
        check_cancelled(cancel)?;
        let img = render(source, edge, options)?;
        let frame = IcoFrame::as_png(img.as_raw(), edge, edge, ExtendedColorType::Rgba8)
            .map_err(encode_failure(IconFormat::Ico))?;
        frames.push(frame);
    }

    let mut data = Vec::new();
    IcoEncoder::new(&mut data)
        .encode_images(&frames)
        .map_err(encode_failure(IconFormat::Ico))?;
    Ok(data)
}

fn encode_icns(
    source: &Source,
    sizes: &[u32],
    options: &ConversionOptions,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ConversionFailure> {
    let mut body = Vec::new();
    for &edge in sizes {
        check_cancelled(cancel)?;
        let code = ICNS_ENTRIES
            .iter()
            .find(|(size, _)| *size == edge)
            .map(|(_, code)| code)
            .ok_or_else(|| ConversionFailure::Encode {
                format: IconFormat::Icns,
                reason: format!("no icns element type for {edge}px"),
            })?;
        let png = encode_png(render(source, edge, options)?, &PngOptions::default())?;

        body.extend_from_slice(code);
        body.extend_from_slice(&icns_length(png.len() + 8)?.to_be_bytes());
        body.extend_from_slice(&png);
    }

    let mut data = Vec::with_capacity(body.len() + 8);
    data.extend_from_slice(b"icns");
    data.extend_from_slice(&icns_length(body.len() + 8)?.to_be_bytes());
    data.extend_from_slice(&body);
    Ok(data)
}

fn icns_length(len: usize) -> Result<u32, ConversionFailure> {
    u32::try_from(len).map_err(|_| ConversionFailure::Encode {
        format: IconFormat::Icns,
        reason: format!("element of {len} bytes is too large"),
    })
}

fn encode_png(img: RgbaImage, png: &PngOptions) -> Result<Vec<u8>, ConversionFailure> {
    let rgba = DynamicImage::ImageRgba8(img);
    let converted = match (png.color_space, png.bit_depth) {
        (ColorSpace::Rgba, BitDepth::Eight) => rgba,
        (ColorSpace::Rgba, BitDepth::Sixteen) => DynamicImage::ImageRgba16(rgba.to_rgba16()),
        (ColorSpace::Rgb, BitDepth::Eight) => DynamicImage::ImageRgb8(rgba.to_rgb8()),
        (ColorSpace::Rgb, BitDepth::Sixteen) => DynamicImage::ImageRgb16(rgba.to_rgb16()),
        (ColorSpace::Grayscale, BitDepth::Eight) => DynamicImage::ImageLuma8(rgba.to_luma8()),
        (ColorSpace::Grayscale, BitDepth::Sixteen) => DynamicImage::ImageLuma16(rgba.to_luma16()),
        (ColorSpace::GrayscaleAlpha, BitDepth::Eight) => {
            DynamicImage::ImageLumaA8(rgba.to_luma_alpha8())
        }
        (ColorSpace::GrayscaleAlpha, BitDepth::Sixteen) => {
            DynamicImage::ImageLumaA16(rgba.to_luma_alpha16())
        }
    };

    let mut cursor = Cursor::new(Vec::new());
    converted
        .write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(encode_failure(IconFormat::Png))?;
    let data = cursor.into_inner();

    match png.dpi {
        Some(dpi) => insert_phys_chunk(data, dpi),
        None => Ok(data),
    }
}

/// Writes a `pHYs` chunk right after `IHDR` so viewers pick up the DPI.
fn insert_phys_chunk(mut data: Vec<u8>, dpi: u32) -> Result<Vec<u8>, ConversionFailure> {
    let ihdr_end = PNG_SIGNATURE_LEN + IHDR_CHUNK_LEN;
    if data.len() < ihdr_end || &data[12..16] != b"IHDR" {
        return Err(ConversionFailure::Encode {
            format: IconFormat::Png,
            reason: "encoder produced PNG without leading IHDR".to_string(),
        });
    }

    let pixels_per_meter = (f64::from(dpi) * INCHES_PER_METER).round() as u32;
    let mut payload = Vec::with_capacity(9);
    payload.extend_from_slice(&pixels_per_meter.to_be_bytes());
    payload.extend_from_slice(&pixels_per_meter.to_be_bytes());
    payload.push(1); // unit: meter

    let mut crc = Crc::new();
    crc.update(b"pHYs");
    crc.update(&payload);

    let mut chunk = Vec::with_capacity(21);
    chunk.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    chunk.extend_from_slice(b"pHYs");
    chunk.extend_from_slice(&payload);
    chunk.extend_from_slice(&crc.sum().to_be_bytes());

    data.splice(ihdr_end..ihdr_end, chunk);
    Ok(data)
}
