use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub const BLACK_WHITE_THRESHOLD: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Four corners in pixel space: top-left, top-right, bottom-right, bottom-left.
pub type Quad = [Point; 4];

/// Axis-aligned box in pixel corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxPx {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoxPx {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Inclusive on every edge.
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x1 && point.x <= self.x2 && point.y >= self.y1 && point.y <= self.y2
    }

    pub fn clamp_point(&self, point: Point) -> Point {
        Point::new(
            point.x.clamp(self.x1, self.x2),
            point.y.clamp(self.y1, self.y2),
        )
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> BoxPx {
        BoxPx {
            x1: self.x1.clamp(0.0, width as f32),
            y1: self.y1.clamp(0.0, height as f32),
            x2: self.x2.clamp(0.0, width as f32),
            y2: self.y2.clamp(0.0, height as f32),
        }
    }

    pub fn intersection_area(&self, other: &BoxPx) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }

    pub fn from_quad(quad: &Quad) -> BoxPx {
        let mut out = BoxPx {
            x1: f32::INFINITY,
            y1: f32::INFINITY,
            x2: f32::NEG_INFINITY,
            y2: f32::NEG_INFINITY,
        };
        for point in quad {
            out.x1 = out.x1.min(point.x);
            out.y1 = out.y1.min(point.y);
            out.x2 = out.x2.max(point.x);
            out.y2 = out.y2.max(point.y);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };

    pub fn is_dark(&self, threshold: u8) -> bool {
        self.r < threshold && self.g < threshold && self.b < threshold
    }
}

/// Something that carries a box and a score, so NMS can run over any detection type.
pub trait Scored {
    fn bounds(&self) -> BoxPx;
    fn score(&self) -> f32;
}

/// Normalized center form (cx, cy, w, h) to pixel corner form.
pub fn decode_box(cx: f32, cy: f32, w: f32, h: f32, img_w: u32, img_h: u32) -> BoxPx {
    let cx = cx * img_w as f32;
    let cy = cy * img_h as f32;
    let w = w * img_w as f32;
    let h = h * img_h as f32;
    BoxPx {
        x1: cx - w / 2.0,
        y1: cy - h / 2.0,
        x2: cx + w / 2.0,
        y2: cy + h / 2.0,
    }
}

pub fn iou(a: &BoxPx, b: &BoxPx) -> f32 {
    let inter = a.intersection_area(b);
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Greedy NMS. Candidates are ordered by score with a stable sort, so equal
/// scores keep their input order. Anything overlapping a kept box with
/// IoU >= `iou_threshold` is dropped.
pub fn non_max_suppression<T: Scored>(detections: Vec<T>, iou_threshold: f32) -> Vec<T> {
    let mut remaining = detections;
    remaining.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<T> = Vec::new();
    let mut queue = remaining.into_iter();
    'outer: for candidate in queue.by_ref() {
        let bounds = candidate.bounds();
        for existing in &kept {
            if iou(&existing.bounds(), &bounds) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

/// Average color of the four edge midpoints, each pulled inward by 2.5% of
/// the shorter side, snapped to pure black or white when within `threshold`.
pub fn sample_background_color(
    image: &RgbaImage,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    threshold: u8,
) -> Rgb {
    let offset = w.min(h) * 0.025;
    let midpoints = [
        Point::new(x + w / 2.0, y + offset),
        Point::new(x + w / 2.0, y + h - offset),
        Point::new(x + offset, y + h / 2.0),
        Point::new(x + w - offset, y + h / 2.0),
    ];

    let (mut r, mut g, mut b) = (0u32, 0u32, 0u32);
    for point in midpoints {
        let [pr, pg, pb] = pixel_at(image, point);
        r += pr as u32;
        g += pg as u32;
        b += pb as u32;
    }
    let avg = |sum: u32| (sum as f32 / 4.0).round() as u8;
    let color = Rgb {
        r: avg(r),
        g: avg(g),
        b: avg(b),
    };

    if color.r <= threshold && color.g <= threshold && color.b <= threshold {
        return Rgb::BLACK;
    }
    let high = 255 - threshold;
    if color.r >= high && color.g >= high && color.b >= high {
        return Rgb::WHITE;
    }
    color
}

fn pixel_at(image: &RgbaImage, point: Point) -> [u8; 3] {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return [0, 0, 0];
    }
    let px = (point.x.floor().max(0.0) as u32).min(width - 1);
    let py = (point.y.floor().max(0.0) as u32).min(height - 1);
    let [r, g, b, _] = image.get_pixel(px, py).0;
    [r, g, b]
}

/// Each corner moves away from the quad by 10% of the quad's own width
/// (top edge) and height (left edge), then is clamped into `bounds`.
pub fn pad_quad(quad: &Quad, bounds: &BoxPx, ratio: f32) -> Quad {
    let [tl, tr, br, bl] = *quad;
    let pad_x = ratio * (tr.x - tl.x);
    let pad_y = ratio * (bl.y - tl.y);
    [
        bounds.clamp_point(Point::new(tl.x - pad_x, tl.y - pad_y)),
        bounds.clamp_point(Point::new(tr.x + pad_x, tr.y - pad_y)),
        bounds.clamp_point(Point::new(br.x + pad_x, br.y + pad_y)),
        bounds.clamp_point(Point::new(bl.x - pad_x, bl.y + pad_y)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Candidate {
        id: usize,
        bounds: BoxPx,
        score: f32,
    }

    impl Scored for Candidate {
        fn bounds(&self) -> BoxPx {
            self.bounds
        }

        fn score(&self) -> f32 {
            self.score
        }
    }

    fn bx(x1: f32, y1: f32, x2: f32, y2: f32) -> BoxPx {
        BoxPx { x1, y1, x2, y2 }
    }

    #[test]
    fn decode_box_converts_center_form() {
        let decoded = decode_box(0.5, 0.5, 0.6, 0.2, 640, 480);
        assert!((decoded.x1 - 128.0).abs() < 1e-3);
        assert!((decoded.y1 - 192.0).abs() < 1e-3);
        assert!((decoded.x2 - 512.0).abs() < 1e-3);
        assert!((decoded.y2 - 288.0).abs() < 1e-3);
        assert!(decoded.is_valid());

        let narrow = decode_box(0.5, 0.5, 0.4, 0.2, 640, 480);
        assert!((narrow.x1 - 192.0).abs() < 1e-3);
        assert!((narrow.x2 - 448.0).abs() < 1e-3);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = bx(0.0, 0.0, 10.0, 10.0);
        let b = bx(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        let half = bx(5.0, 0.0, 15.0, 10.0);
        assert!((iou(&a, &half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_highest_and_breaks_ties_by_input_order() {
        let input = vec![
            Candidate {
                id: 0,
                bounds: bx(0.0, 0.0, 10.0, 10.0),
                score: 0.8,
            },
            Candidate {
                id: 1,
                bounds: bx(1.0, 1.0, 11.0, 11.0),
                score: 0.9,
            },
            Candidate {
                id: 2,
                bounds: bx(50.0, 50.0, 60.0, 60.0),
                score: 0.7,
            },
            Candidate {
                id: 3,
                bounds: bx(100.0, 0.0, 110.0, 10.0),
                score: 0.7,
            },
        ];
        let kept = non_max_suppression(input, 0.5);
        let ids: Vec<usize> = kept.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                assert!(iou(&a.bounds, &b.bounds) < 0.5);
            }
        }
    }

    #[test]
    fn nms_drops_overlap_exactly_at_threshold() {
        // IoU of these two is exactly 1/3.
        let input = vec![
            Candidate {
                id: 0,
                bounds: bx(0.0, 0.0, 10.0, 10.0),
                score: 0.9,
            },
            Candidate {
                id: 1,
                bounds: bx(5.0, 0.0, 15.0, 10.0),
                score: 0.8,
            },
        ];
        let kept = non_max_suppression(input, 50.0 / 150.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, 0);
    }

    #[test]
    fn background_snaps_to_white_and_black() {
        let white = RgbaImage::from_pixel(100, 100, image::Rgba([240, 250, 236, 255]));
        assert_eq!(
            sample_background_color(&white, 10.0, 10.0, 50.0, 40.0, BLACK_WHITE_THRESHOLD),
            Rgb::WHITE
        );
        let black = RgbaImage::from_pixel(100, 100, image::Rgba([12, 3, 30, 255]));
        assert_eq!(
            sample_background_color(&black, 10.0, 10.0, 50.0, 40.0, BLACK_WHITE_THRESHOLD),
            Rgb::BLACK
        );
    }

    #[test]
    fn background_averages_edge_midpoints_only() {
        let mut image = RgbaImage::from_pixel(100, 100, image::Rgba([100, 150, 200, 255]));
        // Text-like pixels in the middle must not influence the estimate.
        for y in 40..60 {
            for x in 40..60 {
                image.put_pixel(x, y, image::Rgba([0, 0, 0, 255]));
            }
        }
        let color = sample_background_color(&image, 0.0, 0.0, 100.0, 100.0, 30);
        assert_eq!(
            color,
            Rgb {
                r: 100,
                g: 150,
                b: 200
            }
        );
    }

    #[test]
    fn pad_quad_grows_and_clamps() {
        let quad = [
            Point::new(10.0, 10.0),
            Point::new(30.0, 10.0),
            Point::new(30.0, 20.0),
            Point::new(10.0, 20.0),
        ];
        let bounds = bx(9.0, 0.0, 100.0, 100.0);
        let padded = pad_quad(&quad, &bounds, 0.1);
        assert_eq!(padded[0], Point::new(9.0, 9.0));
        assert_eq!(padded[1], Point::new(32.0, 9.0));
        assert_eq!(padded[2], Point::new(32.0, 21.0));
        assert_eq!(padded[3], Point::new(9.0, 21.0));
    }
}
