//! Overlay composition.
//!
//! `OverlaySpec::prepare` resolves every asset (font sheets, logo images,
//! colors) once, up front. An overlay whose asset is missing or invalid stays
//! in the prepared set as unavailable and is reported as skipped on every frame; it
//! never fails the frame.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

use crate::frame::{RawFrame, SkippedOverlay};
use crate::process::font::FontFace;

pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SESSION_FORMAT: &str = "%Y-%m-%d";
pub const MAX_TEXT_SCALE: u32 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    #[default]
    TopLeft,
    TopCenter,
    TopRight,
    Center,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl Anchor {
    /// Top-left corner of a `w` x `h` box inside a `frame_w` x `frame_h`
    /// frame. Offsets push away from the anchored edge.
    pub fn place(self, frame: (u32, u32), size: (u32, u32), offset: (i32, i32)) -> (i64, i64) {
        let (fw, fh) = (frame.0 as i64, frame.1 as i64);
        let (w, h) = (size.0 as i64, size.1 as i64);
        let (ox, oy) = (offset.0 as i64, offset.1 as i64);
        let left = ox;
        let hcenter = (fw - w) / 2 + ox;
        let right = fw - w - ox;
        let top = oy;
        let vcenter = (fh - h) / 2 + oy;
        let bottom = fh - h - oy;
        match self {
            Self::TopLeft => (left, top),
            Self::TopCenter => (hcenter, top),
            Self::TopRight => (right, top),
            Self::Center => (hcenter, vcenter),
            Self::BottomLeft => (left, bottom),
            Self::BottomCenter => (hcenter, bottom),
            Self::BottomRight => (right, bottom),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextOverlayConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
    /// Named color or `#rrggbb`.
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub datetime_format: Option<String>,
    /// Glyph sheet PNG; the built-in 5x7 face when absent.
    #[serde(default)]
    pub font: Option<PathBuf>,
}

fn default_color() -> String {
    "white".to_string()
}

fn default_scale() -> u32 {
    1
}

impl TextOverlayConfig {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            name: None,
            text: text.into(),
            anchor: Anchor::TopLeft,
            offset_x: 0,
            offset_y: 0,
            color: default_color(),
            scale: default_scale(),
            background: None,
            datetime_format: None,
            font: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageOverlayConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

fn default_opacity() -> f32 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayConfig {
    Text(TextOverlayConfig),
    Image(ImageOverlayConfig),
}

impl OverlayConfig {
    fn display_name(&self, index: usize) -> String {
        match self {
            Self::Text(text) => text
                .name
                .clone()
                .unwrap_or_else(|| format!("text#{}", index)),
            Self::Image(img) => img
                .name
                .clone()
                .unwrap_or_else(|| format!("image#{}", index)),
        }
    }
}

#[derive(Clone, Debug)]
struct TextOverlay {
    template: String,
    anchor: Anchor,
    offset: (i32, i32),
    color: Rgb<u8>,
    background: Option<Rgb<u8>>,
    scale: u32,
    datetime_format: String,
    font: FontFace,
}

#[derive(Clone, Debug)]
struct ImageOverlay {
    rgba: RgbaImage,
    anchor: Anchor,
    offset: (i32, i32),
    opacity: f32,
}

#[derive(Clone, Debug)]
enum OverlayBody {
    Text(TextOverlay),
    Image(ImageOverlay),
    Unavailable(String),
}

#[derive(Clone, Debug)]
struct PreparedOverlay {
    name: String,
    body: OverlayBody,
}

/// Overlays ready to draw, with all assets already in memory.
#[derive(Clone, Debug, Default)]
pub struct OverlaySpec {
    items: Vec<PreparedOverlay>,
}

impl OverlaySpec {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn prepare(configs: &[OverlayConfig]) -> Self {
        let items = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let name = config.display_name(index);
                let body = match prepare_one(config) {
                    Ok(body) => body,
                    Err(reason) => {
                        log::warn!("overlay '{}' unavailable: {}", name, reason);
                        OverlayBody::Unavailable(reason)
                    }
                };
                PreparedOverlay { name, body }
            })
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Names of overlays whose assets could not be loaded.
    pub fn unavailable(&self) -> Vec<SkippedOverlay> {
        self.items
            .iter()
            .filter_map(|item| match &item.body {
                OverlayBody::Unavailable(reason) => Some(SkippedOverlay {
                    name: item.name.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Draws every overlay onto `pixels` in declaration order and returns
    /// the ones that were skipped.
    pub fn render(&self, pixels: &mut RgbImage, raw: &RawFrame) -> Vec<SkippedOverlay> {
        let mut skipped = Vec::new();
        for item in &self.items {
            let result = match &item.body {
                OverlayBody::Text(text) => draw_text(pixels, text, raw),
                OverlayBody::Image(img) => draw_image(pixels, img),
                OverlayBody::Unavailable(reason) => Err(reason.clone()),
            };
            if let Err(reason) = result {
                skipped.push(SkippedOverlay {
                    name: item.name.clone(),
                    reason,
                });
            }
        }
        skipped
    }
}

fn prepare_one(config: &OverlayConfig) -> Result<OverlayBody, String> {
    match config {
        OverlayConfig::Text(text) => {
            if text.scale == 0 || text.scale > MAX_TEXT_SCALE {
                return Err(format!("scale {} outside 1..={}", text.scale, MAX_TEXT_SCALE));
            }
            let datetime_format = text
                .datetime_format
                .clone()
                .unwrap_or_else(|| DEFAULT_DATETIME_FORMAT.to_string());
            check_datetime_format(&datetime_format)?;
            let color = parse_color(&text.color)?;
            let background = text.background.as_deref().map(parse_color).transpose()?;
            let font = match &text.font {
                Some(path) => FontFace::load_sheet(path).map_err(|e| e.to_string())?,
                None => FontFace::Builtin,
            };
            Ok(OverlayBody::Text(TextOverlay {
                template: text.text.clone(),
                anchor: text.anchor,
                offset: (text.offset_x, text.offset_y),
                color,
                background,
                scale: text.scale,
                datetime_format,
                font,
            }))
        }
        OverlayConfig::Image(img) => {
            let rgba = image::open(&img.path)
                .map_err(|e| format!("image {}: {}", img.path.display(), e))?
                .to_rgba8();
            Ok(OverlayBody::Image(ImageOverlay {
                rgba,
                anchor: img.anchor,
                offset: (img.offset_x, img.offset_y),
                opacity: img.opacity.clamp(0.0, 1.0),
            }))
        }
    }
}

fn check_datetime_format(format: &str) -> Result<(), String> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid datetime_format '{}'", format));
    }
    Ok(())
}

/// Parses a named color or `#rrggbb`.
pub fn parse_color(value: &str) -> Result<Rgb<u8>, String> {
    let value = value.trim();
    if let Some(hex_digits) = value.strip_prefix('#') {
        let bytes = hex::decode(hex_digits).map_err(|_| format!("invalid color '{}'", value))?;
        if bytes.len() != 3 {
            return Err(format!("invalid color '{}'", value));
        }
        return Ok(Rgb([bytes[0], bytes[1], bytes[2]]));
    }
    let rgb = match value.to_ascii_lowercase().as_str() {
        "white" => [255, 255, 255],
        "black" => [0, 0, 0],
        "red" => [255, 0, 0],
        "green" => [0, 255, 0],
        "blue" => [0, 0, 255],
        "yellow" => [255, 255, 0],
        "cyan" => [0, 255, 255],
        "magenta" => [255, 0, 255],
        "gray" | "grey" => [128, 128, 128],
        "orange" => [255, 165, 0],
        _ => return Err(format!("unknown color '{}'", value)),
    };
    Ok(Rgb(rgb))
}

/// Replaces overlay tokens with values from the frame's capture metadata.
pub fn expand_tokens(
    template: &str,
    raw: &RawFrame,
    output: (u32, u32),
    datetime_format: &str,
) -> Result<String, String> {
    let captured: DateTime<Local> = DateTime::from(raw.captured_at());
    let meta = &raw.meta;
    let exposure = match meta.exposure_ms {
        Some(ms) if ms >= 1000.0 => format!("{:.1}s", ms / 1000.0),
        Some(ms) => format!("{}ms", ms.round()),
        None => "-".to_string(),
    };
    let gain = meta
        .gain
        .map(|g| format!("{:.0}", g))
        .unwrap_or_else(|| "-".to_string());
    let temp = meta
        .temperature_c
        .map(|t| format!("{:.1}\u{b0}C", t))
        .unwrap_or_else(|| "-".to_string());

    let mut datetime = String::new();
    if template.contains("{DATETIME}") {
        write!(datetime, "{}", captured.format(datetime_format))
            .map_err(|_| format!("invalid datetime_format '{}'", datetime_format))?;
    }

    Ok(template
        .replace("{CAMERA}", &meta.camera)
        .replace("{EXPOSURE}", &exposure)
        .replace("{GAIN}", &gain)
        .replace("{TEMP}", &temp)
        .replace("{RES}", &format!("{}x{}", output.0, output.1))
        .replace("{FILENAME}", &raw.identity.file_name())
        .replace("{SESSION}", &captured.format(SESSION_FORMAT).to_string())
        .replace("{DATETIME}", &datetime))
}

/// Outer box of a text block plus its padding, or `None` when it does not
/// fit in pixel coordinates.
fn text_box(font: &FontFace, columns: usize, rows: usize, scale: u32) -> Option<((u32, u32), u32)> {
    let columns = u32::try_from(columns).ok()?;
    let rows = u32::try_from(rows).ok()?;
    let block_w = columns
        .checked_mul(font.advance())?
        .checked_sub(1)?
        .checked_mul(scale)?;
    let block_h = rows
        .checked_sub(1)?
        .checked_mul(font.line_height())?
        .checked_add(font.cell().1)?
        .checked_mul(scale)?;
    let pad = scale.checked_mul(2)?;
    let outer = (
        block_w.checked_add(pad.checked_mul(2)?)?,
        block_h.checked_add(pad.checked_mul(2)?)?,
    );
    Some((outer, pad))
}

fn draw_text(pixels: &mut RgbImage, text: &TextOverlay, raw: &RawFrame) -> Result<(), String> {
    let content = expand_tokens(&text.template, raw, pixels.dimensions(), &text.datetime_format)?;
    let lines: Vec<&str> = content.lines().collect();
    let columns = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    if columns == 0 {
        return Ok(());
    }

    let scale = text.scale;
    let (cell_w, cell_h) = text.font.cell();
    let (outer, pad) = text_box(&text.font, columns, lines.len(), scale)
        .ok_or_else(|| "text block too large".to_string())?;
    let (x0, y0) = text.anchor.place(pixels.dimensions(), outer, text.offset);
    if !intersects(pixels.dimensions(), (x0, y0), outer) {
        return Err("text lies outside the frame".to_string());
    }

    if let Some(bg) = text.background {
        fill_rect(pixels, x0, y0, outer.0, outer.1, bg);
    }

    // every offset below stays inside `outer`, which fits in u32
    let origin_x = x0 + pad as i64;
    let origin_y = y0 + pad as i64;
    let line_step = text.font.line_height() as i64 * scale as i64;
    let glyph_step = text.font.advance() as i64 * scale as i64;
    for (row, line) in lines.iter().enumerate() {
        let line_y = origin_y + row as i64 * line_step;
        for (col, c) in line.chars().enumerate() {
            let glyph_x = origin_x + col as i64 * glyph_step;
            for gy in 0..cell_h {
                for gx in 0..cell_w {
                    if text.font.is_lit(c, gx, gy) {
                        fill_rect(
                            pixels,
                            glyph_x + (gx * scale) as i64,
                            line_y + (gy * scale) as i64,
                            scale,
                            scale,
                            text.color,
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn draw_image(pixels: &mut RgbImage, img: &ImageOverlay) -> Result<(), String> {
    let size = img.rgba.dimensions();
    let (x0, y0) = img.anchor.place(pixels.dimensions(), size, img.offset);
    if !intersects(pixels.dimensions(), (x0, y0), size) {
        return Err("image lies outside the frame".to_string());
    }
    let (fw, fh) = (pixels.width() as i64, pixels.height() as i64);
    for (sx, sy, src) in img.rgba.enumerate_pixels() {
        let x = x0 + sx as i64;
        let y = y0 + sy as i64;
        if x < 0 || y < 0 || x >= fw || y >= fh {
            continue;
        }
        let alpha = (src.0[3] as f32 / 255.0) * img.opacity;
        if alpha <= 0.0 {
            continue;
        }
        let dst = pixels.get_pixel_mut(x as u32, y as u32);
        for c in 0..3 {
            let blended = src.0[c] as f32 * alpha + dst.0[c] as f32 * (1.0 - alpha);
            dst.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(())
}

fn intersects(frame: (u32, u32), origin: (i64, i64), size: (u32, u32)) -> bool {
    let (x, y) = origin;
    x < frame.0 as i64 && y < frame.1 as i64 && x + size.0 as i64 > 0 && y + size.1 as i64 > 0
}

fn fill_rect(pixels: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>) {
    let (fw, fh) = (pixels.width() as i64, pixels.height() as i64);
    let x_start = x.max(0);
    let y_start = y.max(0);
    let x_end = (x + w as i64).min(fw);
    let y_end = (y + h as i64).min(fh);
    for py in y_start..y_end {
        for px in x_start..x_end {
            pixels.put_pixel(px as u32, py as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CaptureMeta, FrameIdentity, SampleLayout};
    use image::Rgba;
    use std::time::SystemTime;

    fn raw() -> RawFrame {
        RawFrame::new(
            FrameIdentity::new("/raw/m31_0042.png", 0, SystemTime::UNIX_EPOCH),
            vec![0u8; 4],
            2,
            2,
            crate::frame::BitDepth::Eight,
            SampleLayout::Mono,
            CaptureMeta {
                camera: "ASI676MC".to_string(),
                exposure_ms: Some(2500.0),
                gain: Some(120.0),
                temperature_c: Some(-9.96),
                captured_at: None,
            },
        )
    }

    #[test]
    fn tokens_expand_from_metadata() {
        let text = expand_tokens(
            "{CAMERA} {EXPOSURE} {GAIN} {TEMP} {RES} {FILENAME}",
            &raw(),
            (640, 480),
            DEFAULT_DATETIME_FORMAT,
        )
        .unwrap();
        assert_eq!(text, "ASI676MC 2.5s 120 -10.0\u{b0}C 640x480 m31_0042.png");
    }

    #[test]
    fn short_exposures_render_in_ms() {
        let mut frame = raw();
        frame.meta.exposure_ms = Some(250.0);
        frame.meta.gain = None;
        let text = expand_tokens("{EXPOSURE}/{GAIN}", &frame, (1, 1), DEFAULT_DATETIME_FORMAT).unwrap();
        assert_eq!(text, "250ms/-");
    }

    #[test]
    fn colors_parse_by_name_and_hex() {
        assert_eq!(parse_color("White").unwrap(), Rgb([255, 255, 255]));
        assert_eq!(parse_color("#10ff00").unwrap(), Rgb([16, 255, 0]));
        assert!(parse_color("#10ff").is_err());
        assert!(parse_color("mauve-ish").is_err());
    }

    #[test]
    fn anchors_place_boxes() {
        let frame = (100, 50);
        let size = (10, 5);
        assert_eq!(Anchor::TopLeft.place(frame, size, (2, 3)), (2, 3));
        assert_eq!(Anchor::BottomRight.place(frame, size, (2, 3)), (88, 42));
        assert_eq!(Anchor::Center.place(frame, size, (0, 0)), (45, 22));
        assert_eq!(Anchor::TopCenter.place(frame, size, (0, 0)), (45, 0));
    }

    #[test]
    fn text_draws_in_requested_color() {
        let spec = OverlaySpec::prepare(&[OverlayConfig::Text(TextOverlayConfig {
            color: "#ff0000".to_string(),
            ..TextOverlayConfig::new("T")
        })]);
        let mut pixels = RgbImage::new(20, 20);
        let skipped = spec.render(&mut pixels, &raw());
        assert!(skipped.is_empty());
        // padding 2, top bar of 'T' spans x=2..7 on row 2
        assert_eq!(*pixels.get_pixel(2, 2), Rgb([255, 0, 0]));
        assert_eq!(*pixels.get_pixel(6, 2), Rgb([255, 0, 0]));
        assert_eq!(*pixels.get_pixel(2, 3), Rgb([0, 0, 0]));
    }

    #[test]
    fn background_box_is_filled() {
        let spec = OverlaySpec::prepare(&[OverlayConfig::Text(TextOverlayConfig {
            background: Some("blue".to_string()),
            anchor: Anchor::BottomRight,
            ..TextOverlayConfig::new(" ")
        })]);
        let mut pixels = RgbImage::new(20, 20);
        spec.render(&mut pixels, &raw());
        assert_eq!(*pixels.get_pixel(19, 19), Rgb([0, 0, 255]));
        assert_eq!(*pixels.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn missing_assets_are_skipped_not_fatal() {
        let spec = OverlaySpec::prepare(&[
            OverlayConfig::Text(TextOverlayConfig {
                name: Some("label".to_string()),
                font: Some(PathBuf::from("/nonexistent/font.png")),
                ..TextOverlayConfig::new("hello")
            }),
            OverlayConfig::Image(ImageOverlayConfig {
                name: None,
                path: PathBuf::from("/nonexistent/logo.png"),
                anchor: Anchor::TopRight,
                offset_x: 0,
                offset_y: 0,
                opacity: 1.0,
            }),
            OverlayConfig::Text(TextOverlayConfig::new("ok")),
        ]);
        assert_eq!(spec.unavailable().len(), 2);

        let mut pixels = RgbImage::new(32, 16);
        let skipped = spec.render(&mut pixels, &raw());
        let names: Vec<_> = skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["label", "image#1"]);
        // the third overlay still drew
        assert!(pixels.pixels().any(|p| *p == Rgb([255, 255, 255])));
    }

    #[test]
    fn logo_blends_with_opacity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logo.png");
        RgbaImage::from_pixel(2, 2, Rgba([200, 100, 0, 255])).save(&path)?;

        let spec = OverlaySpec::prepare(&[OverlayConfig::Image(ImageOverlayConfig {
            name: Some("logo".to_string()),
            path,
            anchor: Anchor::BottomRight,
            offset_x: 0,
            offset_y: 0,
            opacity: 0.5,
        })]);
        let mut pixels = RgbImage::from_pixel(4, 4, Rgb([0, 0, 100]));
        assert!(spec.render(&mut pixels, &raw()).is_empty());
        assert_eq!(*pixels.get_pixel(3, 3), Rgb([100, 50, 50]));
        assert_eq!(*pixels.get_pixel(0, 0), Rgb([0, 0, 100]));
        Ok(())
    }

    #[test]
    fn offscreen_overlay_is_reported() {
        let spec = OverlaySpec::prepare(&[OverlayConfig::Text(TextOverlayConfig {
            offset_x: 500,
            ..TextOverlayConfig::new("far away")
        })]);
        let mut pixels = RgbImage::new(16, 16);
        let skipped = spec.render(&mut pixels, &raw());
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn bad_datetime_format_skips_the_overlay() {
        let spec = OverlaySpec::prepare(&[OverlayConfig::Text(TextOverlayConfig {
            name: Some("clock".to_string()),
            datetime_format: Some("%Q".to_string()),
            ..TextOverlayConfig::new("{DATETIME}")
        })]);
        assert_eq!(spec.unavailable().len(), 1);
        let mut pixels = RgbImage::new(16, 16);
        let skipped = spec.render(&mut pixels, &raw());
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].reason.contains("datetime_format"));

        assert!(expand_tokens("{DATETIME}", &raw(), (1, 1), "%Q").is_err());
        // unused formats are never evaluated
        assert!(expand_tokens("{CAMERA}", &raw(), (1, 1), "%Q").is_ok());
    }

    #[test]
    fn oversized_scale_is_rejected() {
        let spec = OverlaySpec::prepare(&[
            OverlayConfig::Text(TextOverlayConfig {
                scale: u32::MAX / 4,
                ..TextOverlayConfig::new("HELLO")
            }),
            OverlayConfig::Text(TextOverlayConfig {
                scale: MAX_TEXT_SCALE + 1,
                ..TextOverlayConfig::new("HELLO")
            }),
        ]);
        assert_eq!(spec.unavailable().len(), 2);
        let mut pixels = RgbImage::new(16, 16);
        assert_eq!(spec.render(&mut pixels, &raw()).len(), 2);
    }

    #[test]
    fn largest_scale_still_draws() {
        let spec = OverlaySpec::prepare(&[OverlayConfig::Text(TextOverlayConfig {
            scale: MAX_TEXT_SCALE,
            ..TextOverlayConfig::new("HELLO")
        })]);
        let mut pixels = RgbImage::new(64, 64);
        assert!(spec.render(&mut pixels, &raw()).is_empty());
        assert!(text_box(&FontFace::Builtin, usize::MAX, 1, 1).is_none());
    }

    #[test]
    fn overlay_config_parses_from_json() -> anyhow::Result<()> {
        let parsed: Vec<OverlayConfig> = serde_json::from_str(
            r#"[{"type":"text","text":"{CAMERA}","anchor":"bottom-left","scale":2},
                {"type":"image","path":"/etc/logo.png","opacity":0.4}]"#,
        )?;
        match &parsed[0] {
            OverlayConfig::Text(t) => {
                assert_eq!(t.anchor, Anchor::BottomLeft);
                assert_eq!(t.scale, 2);
                assert_eq!(t.color, "white");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parsed[1], OverlayConfig::Image(_)));
        Ok(())
    }
}
