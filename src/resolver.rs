use anyhow::Result;
use image::RgbaImage;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::detector::{Candidate, DetectorClass, RawDetection, to_candidates};
use crate::geometry::{
    BLACK_WHITE_THRESHOLD, BoxPx, Point, Rgb, non_max_suppression, sample_background_color,
};
use crate::layout::TextLayout;
use crate::ocr::{OcrBlock, OcrEngine, OcrPage, OcrRequest, OcrStrategy, RegionHint, WordBox};

/// Horizontal and vertical upscale applied to region crops before OCR.
pub const CROP_SCALE_X: u32 = 4;
pub const CROP_SCALE_Y: u32 = 3;
const LINE_CONFIDENCE_MIN: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveOptions {
    pub bubble_confidence: f32,
    pub iou_threshold: f32,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            bubble_confidence: 0.5,
            iou_threshold: 0.5,
        }
    }
}

/// A text-bearing region and everything the later stages attach to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class: DetectorClass,
    pub background_color: Rgb,
    pub text: String,
    pub translated_text: String,
    pub font_size: f32,
    pub word_boxes: Vec<WordBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<TextLayout>,
}

impl Detection {
    fn from_candidate(candidate: &Candidate, background_color: Rgb) -> Self {
        Self {
            x1: candidate.bounds.x1,
            y1: candidate.bounds.y1,
            x2: candidate.bounds.x2,
            y2: candidate.bounds.y2,
            confidence: candidate.confidence,
            class: candidate.class,
            background_color,
            text: String::new(),
            translated_text: String::new(),
            font_size: 0.0,
            word_boxes: Vec::new(),
            layout: None,
        }
    }

    pub fn bounds(&self) -> BoxPx {
        BoxPx {
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
        }
    }
}

/// Confidence and class filter followed by NMS. The result order is the
/// order every later stage walks the regions in.
pub fn select_candidates(
    raw: &[RawDetection],
    width: u32,
    height: u32,
    options: &ResolveOptions,
) -> Vec<Candidate> {
    let candidates = to_candidates(raw, options.bubble_confidence, width, height);
    let filtered = candidates.len();
    let kept = non_max_suppression(candidates, options.iou_threshold);
    info!(
        "detections: {} raw, {} above threshold, {} after NMS",
        raw.len(),
        filtered,
        kept.len()
    );
    kept
}

/// Builds detections for `candidates` and fills in their text. `page` is the
/// full-page OCR result, only consulted by block-assignment engines.
pub async fn resolve_regions<O>(
    image: &RgbaImage,
    candidates: &[Candidate],
    page: Option<OcrPage>,
    ocr: &O,
) -> Vec<Detection>
where
    O: OcrEngine + ?Sized,
{
    let mut detections: Vec<Detection> = candidates
        .iter()
        .map(|candidate| {
            let bounds = candidate.bounds;
            let background = sample_background_color(
                image,
                bounds.x1,
                bounds.y1,
                bounds.width(),
                bounds.height(),
                BLACK_WHITE_THRESHOLD,
            );
            Detection::from_candidate(candidate, background)
        })
        .collect();

    match ocr.strategy() {
        OcrStrategy::Blocks => {
            let blocks = page.unwrap_or_default().into_blocks();
            assign_blocks(&mut detections, &blocks);
        }
        OcrStrategy::RegionCrop => {
            for (idx, detection) in detections.iter_mut().enumerate() {
                match recognize_region(ocr, image, detection).await {
                    Ok(region) => {
                        detection.text = region.text;
                        detection.font_size = region.font_size;
                        detection.word_boxes = region.word_boxes;
                    }
                    Err(err) => {
                        warn!("OCR failed for region {}: {:#}", idx, err);
                    }
                }
            }
        }
    }

    for (idx, detection) in detections.iter().enumerate() {
        debug!(
            "region {} ({}): {:?} font {:.1}",
            idx,
            detection.class.as_str(),
            detection.text,
            detection.font_size
        );
    }
    detections
}

/// Decides which detection may claim each block. The centroid must lie in the
/// detection box; when several boxes qualify the one overlapping the block the
/// most wins, the earliest detection on ties.
fn block_owners(detections: &[Detection], blocks: &[OcrBlock]) -> Vec<Option<usize>> {
    blocks
        .iter()
        .map(|block| {
            let centroid = block.centroid();
            let block_bounds = block.bounds();
            let mut owner: Option<(usize, f32)> = None;
            for (idx, detection) in detections.iter().enumerate() {
                let bounds = detection.bounds();
                if !bounds.contains(centroid) {
                    continue;
                }
                let overlap = bounds.intersection_area(&block_bounds);
                if owner.is_none_or(|(_, best)| overlap > best) {
                    owner = Some((idx, overlap));
                }
            }
            owner.map(|(idx, _)| idx)
        })
        .collect()
}

pub(crate) fn assign_blocks(detections: &mut [Detection], blocks: &[OcrBlock]) {
    let owners = block_owners(detections, blocks);
    let mut assigned: HashSet<usize> = HashSet::new();
    for (idx, detection) in detections.iter_mut().enumerate() {
        let claimed = claim_blocks(idx, blocks, &owners, &mut assigned);
        apply_blocks(detection, claimed);
    }
    let dropped = blocks.len() - assigned.len();
    if dropped > 0 {
        debug!("{} OCR blocks fell outside every detection", dropped);
    }
}

fn claim_blocks<'b>(
    detection_idx: usize,
    blocks: &'b [OcrBlock],
    owners: &[Option<usize>],
    assigned: &mut HashSet<usize>,
) -> Vec<&'b OcrBlock> {
    let mut claimed = Vec::new();
    for (block_idx, block) in blocks.iter().enumerate() {
        if owners[block_idx] != Some(detection_idx) {
            continue;
        }
        if assigned.insert(block_idx) {
            claimed.push(block);
        }
    }
    claimed
}

fn apply_blocks(detection: &mut Detection, mut claimed: Vec<&OcrBlock>) {
    claimed.sort_by(|a, b| a.centroid().y.total_cmp(&b.centroid().y));
    detection.text = claimed
        .iter()
        .map(|block| block.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    detection.word_boxes = claimed
        .iter()
        .flat_map(|block| block.word_boxes.iter().cloned())
        .collect();
    detection.font_size = if claimed.is_empty() {
        0.0
    } else {
        claimed.iter().map(|block| block.font_size).sum::<f32>() / claimed.len() as f32
    };
}

struct RegionText {
    text: String,
    font_size: f32,
    word_boxes: Vec<WordBox>,
}

async fn recognize_region<O>(
    ocr: &O,
    image: &RgbaImage,
    detection: &Detection,
) -> Result<RegionText>
where
    O: OcrEngine + ?Sized,
{
    let (img_w, img_h) = image.dimensions();
    let x = (detection.x1.floor().max(0.0) as u32).min(img_w);
    let y = (detection.y1.floor().max(0.0) as u32).min(img_h);
    let x2 = (detection.x2.ceil().max(0.0) as u32).min(img_w);
    let y2 = (detection.y2.ceil().max(0.0) as u32).min(img_h);
    if x2 <= x || y2 <= y {
        return Ok(RegionText {
            text: String::new(),
            font_size: 0.0,
            word_boxes: Vec::new(),
        });
    }
    let (w, h) = (x2 - x, y2 - y);
    let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
    let scaled = image::imageops::resize(
        &crop,
        w * CROP_SCALE_X,
        h * CROP_SCALE_Y,
        image::imageops::FilterType::Triangle,
    );

    let page = ocr
        .recognize(OcrRequest {
            image: &scaled,
            region: Some(RegionHint {
                class: detection.class,
                background: detection.background_color,
            }),
        })
        .await?;

    let to_source = |point: Point| {
        Point::new(
            point.x / CROP_SCALE_X as f32 + x as f32,
            point.y / CROP_SCALE_Y as f32 + y as f32,
        )
    };
    let word_boxes = page
        .lines()
        .flat_map(|line| {
            line.words.iter().map(move |word| WordBox {
                text: word.text.clone(),
                quad: word.quad.map(to_source),
                confidence: Some(line.conf),
            })
        })
        .collect();

    Ok(RegionText {
        text: page.text().replace('\n', " "),
        font_size: estimate_font_size(&page, detection.class),
        word_boxes,
    })
}

/// Mean line height in source pixels. Dialogue bubbles only trust confident
/// lines; free text counts every line.
fn estimate_font_size(page: &OcrPage, class: DetectorClass) -> f32 {
    let heights: Vec<f32> = page
        .lines()
        .filter(|line| class == DetectorClass::TextFree || line.conf > LINE_CONFIDENCE_MIN)
        .map(|line| line.bbox.height() / CROP_SCALE_Y as f32)
        .collect();
    if heights.is_empty() {
        return 0.0;
    }
    heights.iter().sum::<f32>() / heights.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Quad;
    use crate::ocr::{OcrFuture, PageBlock, PageLine, PageParagraph, PageWord};
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn quad(x1: f32, y1: f32, x2: f32, y2: f32) -> Quad {
        [
            Point::new(x1, y1),
            Point::new(x2, y1),
            Point::new(x2, y2),
            Point::new(x1, y2),
        ]
    }

    fn block(text: &str, q: Quad, font_size: f32) -> OcrBlock {
        OcrBlock {
            text: text.to_string(),
            quad: q,
            font_size,
            word_boxes: vec![WordBox {
                text: text.to_string(),
                quad: q,
                confidence: None,
            }],
        }
    }

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::from_candidate(
            &Candidate {
                bounds: BoxPx { x1, y1, x2, y2 },
                confidence: 0.9,
                class: DetectorClass::TextBubble,
            },
            Rgb::WHITE,
        )
    }

    #[test]
    fn blocks_sort_by_centroid_and_average_font() {
        let mut detections = vec![detection(0.0, 0.0, 100.0, 100.0)];
        let blocks = vec![
            block("SECOND", quad(10.0, 50.0, 90.0, 70.0), 20.0),
            block("FIRST", quad(10.0, 10.0, 90.0, 30.0), 10.0),
            block("OUTSIDE", quad(200.0, 200.0, 220.0, 220.0), 50.0),
        ];
        assign_blocks(&mut detections, &blocks);
        assert_eq!(detections[0].text, "FIRST SECOND");
        assert_eq!(detections[0].word_boxes.len(), 2);
        assert_eq!(detections[0].word_boxes[0].text, "FIRST");
        assert!((detections[0].font_size - 15.0).abs() < 1e-6);
    }

    #[test]
    fn overlapping_boxes_never_share_a_block() {
        let mut detections = vec![
            detection(0.0, 0.0, 100.0, 100.0),
            detection(50.0, 0.0, 200.0, 100.0),
        ];
        // Centroid (85, 50) sits in both boxes; the second overlaps it more.
        let blocks = vec![block("SHARED", quad(60.0, 40.0, 110.0, 60.0), 12.0)];
        assign_blocks(&mut detections, &blocks);
        assert_eq!(detections[0].text, "");
        assert_eq!(detections[0].font_size, 0.0);
        assert_eq!(detections[1].text, "SHARED");

        let mut again = vec![
            detection(0.0, 0.0, 100.0, 100.0),
            detection(50.0, 0.0, 200.0, 100.0),
        ];
        assign_blocks(&mut again, &blocks);
        assert_eq!(again, detections);
    }

    #[test]
    fn equal_overlap_goes_to_earliest_detection() {
        let mut detections = vec![
            detection(0.0, 0.0, 100.0, 100.0),
            detection(0.0, 0.0, 100.0, 100.0),
        ];
        let blocks = vec![block("ONCE", quad(10.0, 10.0, 50.0, 30.0), 12.0)];
        assign_blocks(&mut detections, &blocks);
        assert_eq!(detections[0].text, "ONCE");
        assert_eq!(detections[1].text, "");
    }

    #[test]
    fn selects_candidates_in_confidence_order() {
        let raw = vec![
            RawDetection {
                class_index: 1,
                confidence: 0.7,
                cx: 0.5,
                cy: 0.5,
                w: 0.4,
                h: 0.2,
            },
            RawDetection {
                class_index: 1,
                confidence: 0.9,
                cx: 0.51,
                cy: 0.5,
                w: 0.4,
                h: 0.2,
            },
            RawDetection {
                class_index: 2,
                confidence: 0.6,
                cx: 0.1,
                cy: 0.1,
                w: 0.1,
                h: 0.1,
            },
        ];
        let kept = select_candidates(&raw, 640, 480, &ResolveOptions::default());
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(kept[1].class, DetectorClass::TextFree);
    }

    struct CropOcr {
        seen: Mutex<Vec<(u32, u32)>>,
        fail: bool,
    }

    impl OcrEngine for CropOcr {
        fn strategy(&self) -> OcrStrategy {
            OcrStrategy::RegionCrop
        }

        fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request.image.dimensions());
                if self.fail {
                    return Err(anyhow!("engine crashed"));
                }
                let line = |y: f32, conf: f32, text: &str| PageLine {
                    bbox: BoxPx {
                        x1: 0.0,
                        y1: y,
                        x2: 80.0,
                        y2: y + 30.0,
                    },
                    conf,
                    words: vec![PageWord {
                        text: text.to_string(),
                        quad: quad(40.0, y, 80.0, y + 30.0),
                        conf,
                    }],
                };
                Ok(OcrPage {
                    blocks: vec![PageBlock {
                        quad: quad(0.0, 0.0, 80.0, 90.0),
                        conf: 70.0,
                        paragraphs: vec![PageParagraph {
                            lines: vec![line(0.0, 90.0, "HI"), line(60.0, 20.0, "THERE")],
                        }],
                    }],
                })
            })
        }
    }

    #[tokio::test]
    async fn region_crop_maps_words_back_to_source() {
        let image = RgbaImage::from_pixel(200, 100, image::Rgba([255, 255, 255, 255]));
        let ocr = CropOcr {
            seen: Mutex::new(Vec::new()),
            fail: false,
        };
        let candidates = vec![Candidate {
            bounds: BoxPx {
                x1: 20.0,
                y1: 10.0,
                x2: 70.0,
                y2: 40.0,
            },
            confidence: 0.9,
            class: DetectorClass::TextBubble,
        }];
        let detections = resolve_regions(&image, &candidates, None, &ocr).await;
        assert_eq!(ocr.seen.lock().unwrap().as_slice(), &[(200, 90)]);
        let detection = &detections[0];
        assert_eq!(detection.background_color, Rgb::WHITE);
        assert_eq!(detection.text, "HI THERE");
        // Only the confident line counts for dialogue bubbles: 30 / 3.
        assert!((detection.font_size - 10.0).abs() < 1e-6);
        assert_eq!(detection.word_boxes[0].quad[0], Point::new(30.0, 10.0));
        assert_eq!(detection.word_boxes[1].quad[2], Point::new(40.0, 40.0));
        assert_eq!(detection.word_boxes[1].confidence, Some(20.0));
    }

    #[tokio::test]
    async fn free_text_counts_every_line() {
        let image = RgbaImage::from_pixel(200, 100, image::Rgba([0, 0, 0, 255]));
        let ocr = CropOcr {
            seen: Mutex::new(Vec::new()),
            fail: false,
        };
        let candidates = vec![Candidate {
            bounds: BoxPx {
                x1: 0.0,
                y1: 0.0,
                x2: 50.0,
                y2: 30.0,
            },
            confidence: 0.9,
            class: DetectorClass::TextFree,
        }];
        let detections = resolve_regions(&image, &candidates, None, &ocr).await;
        assert_eq!(detections[0].background_color, Rgb::BLACK);
        assert!((detections[0].font_size - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn ocr_failure_leaves_region_empty() {
        let image = RgbaImage::from_pixel(100, 100, image::Rgba([255, 255, 255, 255]));
        let ocr = CropOcr {
            seen: Mutex::new(Vec::new()),
            fail: true,
        };
        let candidates = vec![
            Candidate {
                bounds: BoxPx {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 40.0,
                    y2: 40.0,
                },
                confidence: 0.9,
                class: DetectorClass::TextBubble,
            },
            Candidate {
                bounds: BoxPx {
                    x1: 50.0,
                    y1: 50.0,
                    x2: 90.0,
                    y2: 90.0,
                },
                confidence: 0.8,
                class: DetectorClass::TextBubble,
            },
        ];
        let detections = resolve_regions(&image, &candidates, None, &ocr).await;
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|detection| detection.text.is_empty()));
        assert_eq!(ocr.seen.lock().unwrap().len(), 2);
    }
}
