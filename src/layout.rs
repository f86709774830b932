use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{BoxPx, Point};

pub const MIN_FONT_SIZE: u32 = 6;
pub const LINE_HEIGHT_RATIO: f32 = 1.2;

/// Rendered width of a single line at a given font size, in pixels.
pub trait TextMeasure {
    fn measure(&self, text: &str, font_size: f32) -> f32;
}

/// The accepted font size and line breaks for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLayout {
    pub font_size: u32,
    pub line_height: f32,
    pub lines: Vec<String>,
    /// False when even the smallest size overflows the box.
    pub fits: bool,
}

impl TextLayout {
    pub fn block_height(&self) -> f32 {
        self.lines.len() as f32 * self.line_height
    }

    /// Top-center anchor of every line, with the whole block centered in `bounds`.
    pub fn line_anchors(&self, bounds: &BoxPx) -> Vec<Point> {
        let center_x = bounds.center().x;
        let top = bounds.y1 + (bounds.height() - self.block_height()) / 2.0;
        (0..self.lines.len())
            .map(|idx| Point::new(center_x, top + idx as f32 * self.line_height))
            .collect()
    }
}

/// Largest font size, counting down from the OCR estimate, whose greedy wrap
/// fits `width` per line and `height` overall. Sizes never go below
/// [`MIN_FONT_SIZE`]; at the floor the best-effort wrap is kept with
/// `fits == false`.
pub fn fit_text(
    text: &str,
    width: f32,
    height: f32,
    estimate: f32,
    measure: &dyn TextMeasure,
) -> TextLayout {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = start_size(estimate);
    if words.is_empty() {
        return TextLayout {
            font_size: start,
            line_height: start as f32 * LINE_HEIGHT_RATIO,
            lines: Vec::new(),
            fits: true,
        };
    }

    let mut size = start;
    loop {
        let font_size = size as f32;
        let line_height = font_size * LINE_HEIGHT_RATIO;
        let wrapped = wrap_words(&words, width, font_size, measure);
        if let Some(lines) = &wrapped
            && lines.len() as f32 * line_height <= height
        {
            return TextLayout {
                font_size: size,
                line_height,
                lines: lines.clone(),
                fits: true,
            };
        }
        if size <= MIN_FONT_SIZE {
            let lines =
                wrapped.unwrap_or_else(|| force_wrap_words(&words, width, font_size, measure));
            debug!(
                "text does not fit {:.0}x{:.0} even at {}px ({} lines)",
                width,
                height,
                size,
                lines.len()
            );
            return TextLayout {
                font_size: size,
                line_height,
                lines,
                fits: false,
            };
        }
        size -= 1;
    }
}

fn start_size(estimate: f32) -> u32 {
    if !estimate.is_finite() || estimate <= MIN_FONT_SIZE as f32 {
        return MIN_FONT_SIZE;
    }
    estimate.floor() as u32
}

/// Greedy wrap. `None` when a single word is wider than the line.
fn wrap_words(
    words: &[&str],
    width: f32,
    font_size: f32,
    measure: &dyn TextMeasure,
) -> Option<Vec<String>> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in words {
        if current.is_empty() {
            if measure.measure(word, font_size) > width {
                return None;
            }
            current.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", current, word);
        if measure.measure(&candidate, font_size) <= width {
            current = candidate;
            continue;
        }
        if measure.measure(word, font_size) > width {
            return None;
        }
        lines.push(std::mem::replace(&mut current, word.to_string()));
    }
    if !current.is_empty() {
        lines.push(current);
    }
    Some(lines)
}

/// Same walk, but an over-wide word just gets a line of its own.
fn force_wrap_words(
    words: &[&str],
    width: f32,
    font_size: f32,
    measure: &dyn TextMeasure,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in words {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", current, word);
        if measure.measure(&candidate, font_size) <= width {
            current = candidate;
        } else {
            lines.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every character is `ratio` of the font size wide.
    struct Monospace {
        ratio: f32,
    }

    impl TextMeasure for Monospace {
        fn measure(&self, text: &str, font_size: f32) -> f32 {
            text.chars().count() as f32 * font_size * self.ratio
        }
    }

    struct Fixed(f32);

    impl TextMeasure for Fixed {
        fn measure(&self, _text: &str, _font_size: f32) -> f32 {
            self.0
        }
    }

    #[test]
    fn over_wide_word_settles_on_floor() {
        let layout = fit_text("UNBREAKABLE", 100.0, 500.0, 30.0, &Fixed(120.0));
        assert_eq!(layout.font_size, MIN_FONT_SIZE);
        assert!(!layout.fits);
        assert_eq!(layout.lines, vec!["UNBREAKABLE".to_string()]);
    }

    #[test]
    fn keeps_estimate_when_it_fits() {
        let measure = Monospace { ratio: 0.5 };
        let layout = fit_text("HOLA MUNDO", 384.0, 96.0, 20.0, &measure);
        assert_eq!(layout.font_size, 20);
        assert_eq!(layout.lines, vec!["HOLA MUNDO".to_string()]);
        assert!(layout.fits);
    }

    #[test]
    fn shrinks_until_height_fits() {
        let measure = Monospace { ratio: 0.5 };
        // At 20px "AAAA BBBB" is 90 wide, so it wraps into two 24px lines.
        let layout = fit_text("AAAA BBBB", 60.0, 30.0, 20.0, &measure);
        assert!(layout.fits);
        assert!(layout.block_height() <= 30.0);
        assert!(layout.font_size < 20);
        for line in &layout.lines {
            assert!(measure.measure(line, layout.font_size as f32) <= 60.0);
        }
    }

    #[test]
    fn floor_keeps_feasible_wrap_even_when_too_tall() {
        let measure = Monospace { ratio: 0.5 };
        let layout = fit_text("AA BB CC DD", 7.0, 5.0, 12.0, &measure);
        assert_eq!(layout.font_size, MIN_FONT_SIZE);
        assert!(!layout.fits);
        assert_eq!(layout.lines.len(), 4);
    }

    #[test]
    fn forced_wrap_isolates_wide_words() {
        let measure = Monospace { ratio: 1.0 };
        let layout = fit_text("A LONGWORD B C", 20.0, 10.0, 6.0, &measure);
        assert!(!layout.fits);
        assert_eq!(layout.lines, vec!["A", "LONGWORD", "B C"]);
    }

    #[test]
    fn estimate_below_floor_starts_at_floor() {
        let layout = fit_text("", 10.0, 10.0, 0.0, &Fixed(1.0));
        assert_eq!(layout.font_size, MIN_FONT_SIZE);
        assert!(layout.lines.is_empty());
        assert!(layout.fits);
    }

    #[test]
    fn anchors_center_block_vertically() {
        let layout = TextLayout {
            font_size: 10,
            line_height: 12.0,
            lines: vec!["A".to_string(), "B".to_string()],
            fits: true,
        };
        let bounds = BoxPx {
            x1: 0.0,
            y1: 0.0,
            x2: 100.0,
            y2: 44.0,
        };
        let anchors = layout.line_anchors(&bounds);
        assert_eq!(anchors, vec![Point::new(50.0, 10.0), Point::new(50.0, 22.0)]);
    }
}
