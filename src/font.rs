use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

use crate::layout::TextMeasure;

/// Comic lettering first, then common system faces.
pub const FALLBACK_FAMILIES: &[&str] = &["CC Wild Words", "Comic Sans MS", "Arial", "sans-serif"];
const HEURISTIC_ASCENT: f32 = 0.8;

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    family: Option<String>,
    face_index: u32,
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn ascent_ratio(&self) -> f32 {
        self.ascender.max(0) as f32 / self.units_per_em.max(1) as f32
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data, 0)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

/// The lettering face: glyph metrics for layout plus the font database the
/// text renderer resolves the same family from.
#[derive(Clone)]
pub struct OverlayFont {
    metrics: Option<FontMetrics>,
    family: String,
    db: Arc<fontdb::Database>,
}

impl OverlayFont {
    /// No font data at all; widths come from per-character estimates.
    pub fn heuristic() -> Self {
        Self {
            metrics: None,
            family: "sans-serif".to_string(),
            db: Arc::new(fontdb::Database::new()),
        }
    }

    pub fn resolve(font_path: Option<&Path>, font_family: Option<&str>) -> Result<Self> {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();

        if let Some(path) = font_path {
            db.load_font_file(path)
                .with_context(|| format!("failed to load font: {}", path.display()))?;
            let metrics = load_font_metrics(path)?;
            let family = metrics
                .family()
                .map(|name| name.to_string())
                .or_else(|| font_family.map(|name| name.to_string()))
                .unwrap_or_else(|| "sans-serif".to_string());
            return Ok(Self {
                metrics: Some(metrics),
                family,
                db: Arc::new(db),
            });
        }

        let requested = font_family.filter(|name| !name.trim().is_empty());
        for candidate in requested.into_iter().chain(FALLBACK_FAMILIES.iter().copied()) {
            match load_bold_italic(&db, candidate) {
                Ok(metrics) => {
                    let family = metrics
                        .family()
                        .map(|name| name.to_string())
                        .unwrap_or_else(|| candidate.to_string());
                    debug!("overlay font: {}", family);
                    return Ok(Self {
                        metrics: Some(metrics),
                        family,
                        db: Arc::new(db),
                    });
                }
                Err(err) => debug!("font candidate {} skipped: {}", candidate, err),
            }
        }

        warn!("no overlay font found; falling back to estimated glyph widths");
        Ok(Self {
            metrics: None,
            family: "sans-serif".to_string(),
            db: Arc::new(db),
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn database(&self) -> Arc<fontdb::Database> {
        Arc::clone(&self.db)
    }

    /// Distance from the top of the em box to the baseline, per pixel of font size.
    pub fn ascent_ratio(&self) -> f32 {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.ascent_ratio())
            .filter(|ratio| *ratio > 0.0)
            .unwrap_or(HEURISTIC_ASCENT)
    }

    /// CSS font-family list: the resolved face first, then the fallbacks.
    pub fn font_family_list(&self) -> String {
        let mut families = Vec::new();
        if self.family != "sans-serif" {
            families.push(self.family.as_str());
        }
        for fallback in FALLBACK_FAMILIES.iter().copied() {
            if !families.iter().any(|name| name.eq_ignore_ascii_case(fallback)) {
                families.push(fallback);
            }
        }
        families
            .into_iter()
            .map(|name| {
                if name == "sans-serif" {
                    name.to_string()
                } else {
                    format!("'{}'", name.replace('\'', ""))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl TextMeasure for OverlayFont {
    fn measure(&self, text: &str, font_size: f32) -> f32 {
        measure_text_width_px(text, font_size, self.metrics.as_ref())
    }
}

pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font
        && let Ok(face) = Face::parse(&font.data, font.face_index)
    {
        let mut advance = 0u32;
        for ch in text.chars() {
            if ch == ' ' {
                advance = advance.saturating_add(font.space_advance as u32);
                continue;
            }
            let glyph_advance = face
                .glyph_index(ch)
                .and_then(|glyph| face.glyph_hor_advance(glyph))
                .unwrap_or(font.space_advance);
            advance = advance.saturating_add(glyph_advance as u32);
        }
        let units = font.units_per_em.max(1) as f32;
        return advance as f32 * (font_size / units);
    }
    estimate_text_width_units(text) * font_size
}

/// Bold italic capitals run wide, so the estimate leans generous.
fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.3
    } else if ch.is_ascii_uppercase() || ch.is_ascii_digit() {
        0.68
    } else if ch.is_ascii_alphabetic() {
        0.58
    } else if ch.is_ascii() {
        0.38
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF | 0xAC00..=0xD7AF
    ) {
        1.0
    } else {
        0.7
    }
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars().map(estimate_char_units).sum()
}

fn load_font_metrics_from_data(data: &[u8], face_index: u32) -> Result<FontMetrics> {
    let face = Face::parse(data, face_index).map_err(|err| anyhow!("{}", err))?;
    let units_per_em = face.units_per_em().max(1);
    let space_advance = face
        .glyph_index(' ')
        .and_then(|id| face.glyph_hor_advance(id))
        .unwrap_or(units_per_em / 2);
    Ok(FontMetrics {
        data: Arc::new(data.to_vec()),
        units_per_em,
        space_advance,
        ascender: face.ascender(),
        family: extract_family_name(&face),
        face_index,
    })
}

fn load_bold_italic(db: &fontdb::Database, family: &str) -> Result<FontMetrics> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        weight: fontdb::Weight::BOLD,
        style: fontdb::Style::Italic,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let (data, face_index) = db
        .with_face_data(id, |data, index| (data.to_vec(), index))
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    load_font_metrics_from_data(&data, face_index)
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_width_scales_with_font_size() {
        let font = OverlayFont::heuristic();
        let small = font.measure("HOLA MUNDO", 10.0);
        let large = font.measure("HOLA MUNDO", 20.0);
        assert!(small > 0.0);
        assert!((large - 2.0 * small).abs() < 1e-4);
        assert!(font.measure("WIDE", 10.0) > font.measure("wide", 10.0));
        assert_eq!(font.measure("", 30.0), 0.0);
    }

    #[test]
    fn family_list_quotes_names_and_dedups() {
        let font = OverlayFont::heuristic();
        assert_eq!(
            font.font_family_list(),
            "'CC Wild Words', 'Comic Sans MS', 'Arial', sans-serif"
        );
        assert!((font.ascent_ratio() - HEURISTIC_ASCENT).abs() < 1e-6);
    }
}
