use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::metadata::Orientation;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageDecoder, ImageEncoder};
use serde::Deserialize;

use crate::config::ProxyStoreConfig;
use crate::error::{Error, Result};

/// Content types accepted for upload and for cached originals.
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/svg+xml",
    "image/svg",
    "image/bmp",
    "image/apng",
    "image/avif",
];

/// Animated/video types passed through untouched in fit mode so motion
/// survives (a resize would flatten them to a still).
const PASSTHROUGH_TYPES: &[&str] = &["image/gif", "image/apng", "video/mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    Cover,
    Fit,
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingMode::Cover => write!(f, "Cover"),
            ScalingMode::Fit => write!(f, "Fit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Match,
    #[serde(alias = "jpg")]
    JPEG,
    PNG,
    WEBP,
    AVIF,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Match => write!(f, "Match"),
            OutputFormat::JPEG => write!(f, "JPEG"),
            OutputFormat::PNG => write!(f, "PNG"),
            OutputFormat::WEBP => write!(f, "WEBP"),
            OutputFormat::AVIF => write!(f, "AVIF"),
        }
    }
}

/// Resolved transformation request. Zero width/height means unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    pub width: u32,
    pub height: u32,
    pub mode: ScalingMode,
    pub format: OutputFormat,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            mode: ScalingMode::Fit,
            format: OutputFormat::Match,
        }
    }
}

/// Dimension caps from the proxy-store configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_custom_width: u32,
    pub max_custom_height: u32,
}

impl From<&ProxyStoreConfig> for Limits {
    fn from(c: &ProxyStoreConfig) -> Self {
        Self {
            max_width: c.max_image_width,
            max_height: c.max_image_height,
            max_custom_width: c.max_custom_image_width,
            max_custom_height: c.max_custom_image_height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Processed {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Sniff a content type from the leading bytes. Codec detection misses
/// SVG, so a text scan backs it up; APNG is split off from plain PNG by
/// looking for the animation control chunk ahead of the first frame.
pub fn sniff_content_type(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(512)];
    if let Some(kind) = infer::get(bytes) {
        let mime = kind.mime_type();
        if mime == "image/png" && is_apng(bytes) {
            return Some("image/apng".into());
        }
        return Some(mime.to_string());
    }
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    if text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg")) {
        return Some("image/svg+xml".into());
    }
    None
}

fn is_apng(bytes: &[u8]) -> bool {
    let idat = bytes.windows(4).position(|w| w == b"IDAT");
    let actl = bytes.windows(4).position(|w| w == b"acTL");
    matches!((actl, idat), (Some(a), Some(i)) if a < i)
}

pub fn is_accepted_type(content_type: &str) -> bool {
    ACCEPTED_CONTENT_TYPES.contains(&content_type)
}

/// Animated sources are returned unchanged when the request would not
/// deliberately flatten them.
pub fn is_passthrough(content_type: &str, opts: &TransformOptions) -> bool {
    PASSTHROUGH_TYPES.contains(&content_type)
        && opts.mode == ScalingMode::Fit
        && matches!(
            opts.format,
            OutputFormat::Match | OutputFormat::WEBP | OutputFormat::AVIF
        )
}

fn is_svg(content_type: &str) -> bool {
    content_type == "image/svg+xml" || content_type == "image/svg"
}

/// Run the full decode → orient → resize → encode pipeline. CPU-bound;
/// callers dispatch it on a blocking thread.
pub fn process(
    bytes: &[u8],
    content_type: Option<&str>,
    opts: &TransformOptions,
    limits: &Limits,
) -> Result<Processed> {
    let source_type = content_type
        .map(str::to_string)
        .or_else(|| sniff_content_type(bytes));

    if let Some(ct) = &source_type {
        if is_passthrough(ct, opts) {
            return Ok(Processed {
                bytes: Bytes::copy_from_slice(bytes),
                content_type: ct.clone(),
            });
        }
    }

    let svg = source_type.as_deref().is_some_and(is_svg);
    let (img, decoded_format) = if svg {
        (rasterize_svg(bytes)?, None)
    } else {
        decode_oriented(bytes)?
    };

    let (w, h) = plan_dimensions(img.dimensions(), opts, limits);
    let resized = resize(img, opts.mode, w, h, limits);

    let target = match opts.format {
        OutputFormat::JPEG => EncodeFormat::Jpeg,
        OutputFormat::PNG => EncodeFormat::Png,
        OutputFormat::WEBP => EncodeFormat::Webp,
        OutputFormat::AVIF => EncodeFormat::Avif,
        // Match keeps the decoded format; SVG rasterizes to PNG.
        OutputFormat::Match => match decoded_format {
            Some(image::ImageFormat::Jpeg) => EncodeFormat::Jpeg,
            Some(image::ImageFormat::WebP) => EncodeFormat::Webp,
            Some(image::ImageFormat::Avif) => EncodeFormat::Avif,
            Some(image::ImageFormat::Gif) => EncodeFormat::Gif,
            _ => EncodeFormat::Png,
        },
    };

    let (out, content_type) = encode(&resized, target)?;
    Ok(Processed {
        bytes: Bytes::from(out),
        content_type: content_type.to_string(),
    })
}

/// Decode and apply the EXIF orientation before any geometry runs.
fn decode_oriented(bytes: &[u8]) -> Result<(DynamicImage, Option<image::ImageFormat>)> {
    let guessed = image::guess_format(bytes).ok();
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::InvalidImage(e.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| Error::InvalidImage(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| Error::InvalidImage(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok((img, guessed))
}

fn rasterize_svg(bytes: &[u8]) -> Result<DynamicImage> {
    let options = resvg::usvg::Options::default();
    let tree = resvg::usvg::Tree::from_data(bytes, &options)
        .map_err(|e| Error::InvalidImage(format!("svg: {e}")))?;
    let size = tree.size().to_int_size();
    let (w, h) = (size.width().max(1), size.height().max(1));
    let mut pixmap = resvg::tiny_skia::Pixmap::new(w, h)
        .ok_or_else(|| Error::InvalidImage("svg has no area".into()))?;
    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::default(),
        &mut pixmap.as_mut(),
    );
    let mut rgba = Vec::with_capacity((w as usize) * (h as usize) * 4);
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    let buf = image::RgbaImage::from_raw(w, h, rgba)
        .ok_or_else(|| Error::InvalidImage("svg rasterization failed".into()))?;
    Ok(DynamicImage::ImageRgba8(buf))
}

/// Apply the dimension policy: explicit sizes clamp to the custom caps,
/// fully unspecified requests clamp to the store caps only when the
/// original exceeds them, and a half-specified request leaves the other
/// axis free so aspect ratio is preserved.
fn plan_dimensions(
    (meta_w, meta_h): (u32, u32),
    opts: &TransformOptions,
    limits: &Limits,
) -> (u32, u32) {
    let mut w = if opts.width > 0 {
        opts.width.min(limits.max_custom_width)
    } else {
        0
    };
    let mut h = if opts.height > 0 {
        opts.height.min(limits.max_custom_height)
    } else {
        0
    };
    if w == 0 && h == 0 {
        if meta_w > limits.max_width {
            w = limits.max_width;
        }
        if meta_h > limits.max_height {
            h = limits.max_height;
        }
    }
    (w, h)
}

fn resize(img: DynamicImage, mode: ScalingMode, w: u32, h: u32, limits: &Limits) -> DynamicImage {
    let (ow, oh) = img.dimensions();
    match mode {
        ScalingMode::Cover => {
            let (tw, th) = match (w, h) {
                (0, 0) => return img,
                (w, 0) => (w, ratio(oh, w, ow)),
                (0, h) => (ratio(ow, h, oh), h),
                (w, h) => (w, h),
            };
            if (tw, th) == (ow, oh) {
                return img;
            }
            img.resize_to_fill(tw.max(1), th.max(1), image::imageops::FilterType::Lanczos3)
        }
        ScalingMode::Fit => {
            let (bw, bh) = if w == 0 && h == 0 {
                (limits.max_width, limits.max_height)
            } else {
                (w, h)
            };
            let sw = if bw > 0 { bw as f64 / ow as f64 } else { f64::INFINITY };
            let sh = if bh > 0 { bh as f64 / oh as f64 } else { f64::INFINITY };
            let scale = sw.min(sh).min(1.0);
            if scale >= 1.0 {
                return img;
            }
            let tw = ((ow as f64 * scale).round() as u32).max(1);
            let th = ((oh as f64 * scale).round() as u32).max(1);
            img.resize_exact(tw, th, image::imageops::FilterType::Lanczos3)
        }
    }
}

fn ratio(side: u32, target: u32, other: u32) -> u32 {
    ((side as f64 * target as f64 / other as f64).round() as u32).max(1)
}

enum EncodeFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
    Gif,
}

fn encode(img: &DynamicImage, target: EncodeFormat) -> Result<(Vec<u8>, &'static str)> {
    let mut out = Vec::new();
    match target {
        EncodeFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let enc = JpegEncoder::new_with_quality(&mut out, 80);
            enc.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| Error::InternalError(format!("jpeg encode: {e}")))?;
            Ok((out, "image/jpeg"))
        }
        EncodeFormat::Png => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let enc = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
            enc.write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| Error::InternalError(format!("png encode: {e}")))?;
            Ok((out, "image/png"))
        }
        EncodeFormat::Webp => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let mut config = webp::WebPConfig::new()
                .map_err(|_| Error::InternalError("webp config".into()))?;
            config.quality = 80.0;
            config.alpha_quality = 80;
            let encoder = webp::Encoder::from_rgba(rgba.as_raw(), w, h);
            let mem = encoder
                .encode_advanced(&config)
                .map_err(|e| Error::InternalError(format!("webp encode: {e:?}")))?;
            out.extend_from_slice(&mem);
            Ok((out, "image/webp"))
        }
        EncodeFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let enc = AvifEncoder::new_with_speed_quality(&mut out, 4, 50);
            enc.write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| Error::InternalError(format!("avif encode: {e}")))?;
            Ok((out, "image/avif"))
        }
        EncodeFormat::Gif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let mut enc = GifEncoder::new(&mut out);
            enc.encode(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| Error::InternalError(format!("gif encode: {e}")))?;
            drop(enc);
            Ok((out, "image/gif"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_width: 1280,
            max_height: 1280,
            max_custom_width: 8000,
            max_custom_height: 8000,
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            w,
            h,
            image::Rgba([120, 40, 200, 255]),
        ));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn sniffs_png_and_svg() {
        assert_eq!(
            sniff_content_type(&png_bytes(2, 2)).as_deref(),
            Some("image/png")
        );
        assert_eq!(
            sniff_content_type(b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>").as_deref(),
            Some("image/svg+xml")
        );
        assert_eq!(
            sniff_content_type(b"<?xml version=\"1.0\"?><svg/>").as_deref(),
            Some("image/svg+xml")
        );
        assert_eq!(sniff_content_type(b"plain text"), None);
    }

    #[test]
    fn passthrough_predicate() {
        let fit_match = TransformOptions::default();
        assert!(is_passthrough("image/gif", &fit_match));
        assert!(is_passthrough("video/mp4", &fit_match));

        let cover = TransformOptions {
            mode: ScalingMode::Cover,
            ..Default::default()
        };
        assert!(!is_passthrough("image/gif", &cover));

        let forced_png = TransformOptions {
            format: OutputFormat::PNG,
            ..Default::default()
        };
        assert!(!is_passthrough("image/gif", &forced_png));
        assert!(!is_passthrough("image/jpeg", &fit_match));
    }

    #[test]
    fn dimension_policy() {
        let limits = limits();
        // explicit sizes clamp to the custom cap, not rejected
        let opts = TransformOptions {
            width: 20_000,
            height: 9000,
            ..Default::default()
        };
        assert_eq!(plan_dimensions((100, 100), &opts, &limits), (8000, 8000));

        // unspecified clamps only when the original exceeds the store cap
        let unset = TransformOptions::default();
        assert_eq!(plan_dimensions((640, 480), &unset, &limits), (0, 0));
        assert_eq!(plan_dimensions((4000, 480), &unset, &limits), (1280, 0));
        assert_eq!(plan_dimensions((4000, 3000), &unset, &limits), (1280, 1280));

        // half-specified leaves the other axis free
        let half = TransformOptions {
            height: 500,
            ..Default::default()
        };
        assert_eq!(plan_dimensions((4000, 3000), &half, &limits), (0, 500));
    }

    #[test]
    fn fit_never_enlarges() {
        let src = png_bytes(64, 32);
        let opts = TransformOptions {
            width: 500,
            height: 500,
            ..Default::default()
        };
        let out = process(&src, Some("image/png"), &opts, &limits()).unwrap();
        let img = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(img.dimensions(), (64, 32));
    }

    #[test]
    fn fit_scales_down_preserving_aspect() {
        let src = png_bytes(400, 200);
        let opts = TransformOptions {
            width: 100,
            height: 100,
            ..Default::default()
        };
        let out = process(&src, Some("image/png"), &opts, &limits()).unwrap();
        let img = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(img.dimensions(), (100, 50));
    }

    #[test]
    fn height_only_resize() {
        let src = png_bytes(400, 200);
        let opts = TransformOptions {
            height: 50,
            ..Default::default()
        };
        let out = process(&src, Some("image/png"), &opts, &limits()).unwrap();
        let img = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(img.dimensions(), (100, 50));
    }

    #[test]
    fn cover_fills_exact_box() {
        let src = png_bytes(400, 200);
        let opts = TransformOptions {
            width: 128,
            height: 128,
            mode: ScalingMode::Cover,
            format: OutputFormat::PNG,
        };
        let out = process(&src, Some("image/png"), &opts, &limits()).unwrap();
        let img = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(img.dimensions(), (128, 128));
        assert_eq!(out.content_type, "image/png");
    }

    #[test]
    fn match_keeps_decoded_format() {
        let src = png_bytes(8, 8);
        let out = process(&src, Some("image/png"), &TransformOptions::default(), &limits())
            .unwrap();
        assert_eq!(out.content_type, "image/png");
    }

    #[test]
    fn explicit_webp_encode() {
        let src = png_bytes(8, 8);
        let opts = TransformOptions {
            format: OutputFormat::WEBP,
            ..Default::default()
        };
        let out = process(&src, Some("image/png"), &opts, &limits()).unwrap();
        assert_eq!(out.content_type, "image/webp");
        assert_eq!(sniff_content_type(&out.bytes).as_deref(), Some("image/webp"));
    }

    #[test]
    fn svg_becomes_png_on_match() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10">
            <rect width="10" height="10" fill="red"/></svg>"#;
        let out = process(svg, Some("image/svg+xml"), &TransformOptions::default(), &limits())
            .unwrap();
        assert_eq!(out.content_type, "image/png");
        let img = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(img.dimensions(), (10, 10));
    }

    #[test]
    fn gif_passthrough_returns_original_bytes() {
        // single-frame gif built through the encoder
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([1, 2, 3, 255]),
        ));
        let mut raw = Vec::new();
        {
            let mut enc = GifEncoder::new(&mut raw);
            let rgba = img.to_rgba8();
            enc.encode(rgba.as_raw(), 4, 4, ExtendedColorType::Rgba8).unwrap();
        }
        let out = process(&raw, Some("image/gif"), &TransformOptions::default(), &limits())
            .unwrap();
        assert_eq!(out.bytes.as_ref(), raw.as_slice());
        assert_eq!(out.content_type, "image/gif");
    }

    #[test]
    fn garbage_is_invalid_image() {
        let err = process(b"not an image", None, &TransformOptions::default(), &limits())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }
}
