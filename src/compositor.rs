use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use resvg::render;
use tiny_skia::{
    Color, ColorU8, FillRule, GradientStop, Paint, PathBuilder, Pixmap, RadialGradient, Rect,
    SpreadMode, Transform,
};
use usvg::{Options, Tree};

use crate::font::OverlayFont;
use crate::geometry::{Quad, Rgb, pad_quad};
use crate::layout::TextLayout;
use crate::resolver::Detection;

const WORD_PAD_RATIO: f32 = 0.1;
const GRADIENT_SOLID_STOP: f32 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub text_color: Rgb,
    pub outline_color: Rgb,
    pub outline_width: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            text_color: Rgb::BLACK,
            outline_color: Rgb::WHITE,
            outline_width: 4.0,
        }
    }
}

/// Accepts `#rgb` and `#rrggbb`.
pub fn parse_hex_color(value: &str) -> Result<Rgb> {
    let hex = value.trim().trim_start_matches('#');
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|ch| [ch, ch]).collect(),
        6 => hex.to_string(),
        _ => return Err(anyhow!("invalid color '{}'", value)),
    };
    let channel = |idx: usize| {
        u8::from_str_radix(&expanded[idx..idx + 2], 16)
            .map_err(|_| anyhow!("invalid color '{}'", value))
    };
    Ok(Rgb {
        r: channel(0)?,
        g: channel(2)?,
        b: channel(4)?,
    })
}

/// Draws every detection onto a copy of `image`. Per detection the layers are
/// word erase, then the gradient patch, then the text; later detections paint
/// over earlier ones.
pub fn compose(
    image: &RgbaImage,
    detections: &[Detection],
    font: &OverlayFont,
    style: &OverlayStyle,
) -> Result<RgbaImage> {
    let mut pixmap = pixmap_from_image(image)?;
    let options = Options {
        fontdb: font.database(),
        ..Options::default()
    };

    for detection in detections {
        erase_words(&mut pixmap, detection);
        if detection.translated_text.is_empty() {
            continue;
        }
        paint_gradient_patch(&mut pixmap, detection);
        if let Some(layout) = &detection.layout
            && !layout.lines.is_empty()
        {
            let svg = text_svg(image.width(), image.height(), detection, layout, font, style);
            let tree = Tree::from_str(&svg, &options).with_context(|| "failed to parse text SVG")?;
            render(&tree, Transform::identity(), &mut pixmap.as_mut());
        }
    }

    image_from_pixmap(&pixmap)
}

fn erase_words(pixmap: &mut Pixmap, detection: &Detection) {
    let bounds = detection.bounds();
    let mut paint = Paint::default();
    let Rgb { r, g, b } = detection.background_color;
    paint.set_color_rgba8(r, g, b, 255);
    paint.anti_alias = true;
    for word in &detection.word_boxes {
        let padded = pad_quad(&word.quad, &bounds, WORD_PAD_RATIO);
        if let Some(path) = quad_path(&padded) {
            pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
        }
    }
}

fn quad_path(quad: &Quad) -> Option<tiny_skia::Path> {
    let mut builder = PathBuilder::new();
    builder.move_to(quad[0].x, quad[0].y);
    for point in &quad[1..] {
        builder.line_to(point.x, point.y);
    }
    builder.close();
    builder.finish()
}

/// Solid background out to 80% of the half-diagonal, transparent at 100%.
fn paint_gradient_patch(pixmap: &mut Pixmap, detection: &Detection) {
    let bounds = detection.bounds();
    let center = bounds.center();
    let radius = (bounds.width().powi(2) + bounds.height().powi(2)).sqrt() / 2.0;
    let Rgb { r, g, b } = detection.background_color;
    let solid = Color::from_rgba8(r, g, b, 255);
    let clear = Color::from_rgba8(r, g, b, 0);
    let Some(shader) = RadialGradient::new(
        tiny_skia::Point::from_xy(center.x, center.y),
        tiny_skia::Point::from_xy(center.x, center.y),
        radius,
        vec![
            GradientStop::new(0.0, solid),
            GradientStop::new(GRADIENT_SOLID_STOP, solid),
            GradientStop::new(1.0, clear),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    ) else {
        return;
    };
    let Some(rect) = Rect::from_xywh(bounds.x1, bounds.y1, bounds.width(), bounds.height()) else {
        return;
    };
    let paint = Paint {
        shader,
        anti_alias: true,
        ..Paint::default()
    };
    pixmap.fill_rect(rect, &paint, Transform::identity(), None);
}

fn text_svg(
    width: u32,
    height: u32,
    detection: &Detection,
    layout: &TextLayout,
    font: &OverlayFont,
    style: &OverlayStyle,
) -> String {
    let font_size = layout.font_size as f32;
    let ascent = font.ascent_ratio() * font_size;
    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    ));
    svg.push_str(&format!(
        r#"<g font-family="{family}" font-size="{size}" font-style="italic" font-weight="bold" text-anchor="middle" fill="{fill}" stroke="{stroke}" stroke-width="{stroke_width}" stroke-linejoin="round" paint-order="stroke">"#,
        family = escape_xml(&font.font_family_list()),
        size = font_size,
        fill = hex(style.text_color),
        stroke = hex(style.outline_color),
        stroke_width = style.outline_width
    ));
    for (line, anchor) in layout
        .lines
        .iter()
        .zip(layout.line_anchors(&detection.bounds()))
    {
        svg.push_str(&format!(
            r#"<text x="{x}" y="{y}">{text}</text>"#,
            x = anchor.x,
            y = anchor.y + ascent,
            text = escape_xml(line)
        ));
    }
    svg.push_str("</g></svg>");
    svg
}

fn hex(color: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
}

fn pixmap_from_image(image: &RgbaImage) -> Result<Pixmap> {
    let mut pixmap = Pixmap::new(image.width(), image.height())
        .ok_or_else(|| anyhow!("cannot draw on a {}x{} image", image.width(), image.height()))?;
    for (dst, src) in pixmap.pixels_mut().iter_mut().zip(image.pixels()) {
        let [r, g, b, a] = src.0;
        *dst = ColorU8::from_rgba(r, g, b, a).premultiply();
    }
    Ok(pixmap)
}

fn image_from_pixmap(pixmap: &Pixmap) -> Result<RgbaImage> {
    let mut data = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let color = pixel.demultiply();
        data.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
    }
    RgbaImage::from_raw(pixmap.width(), pixmap.height(), data)
        .ok_or_else(|| anyhow!("failed to build image buffer from canvas"))
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
