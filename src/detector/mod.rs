mod recorded;

use anyhow::{Result, anyhow};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::geometry::{BoxPx, Scored, decode_box};

pub use recorded::RecordedDetector;

pub const INPUT_SIZE: u32 = 640;
const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorClass {
    Bubble,
    TextBubble,
    TextFree,
}

impl DetectorClass {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(DetectorClass::Bubble),
            1 => Some(DetectorClass::TextBubble),
            2 => Some(DetectorClass::TextFree),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            DetectorClass::Bubble => 0,
            DetectorClass::TextBubble => 1,
            DetectorClass::TextFree => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorClass::Bubble => "bubble",
            DetectorClass::TextBubble => "text_bubble",
            DetectorClass::TextFree => "text_free",
        }
    }

    pub fn carries_text(&self) -> bool {
        !matches!(self, DetectorClass::Bubble)
    }
}

/// One query slot of the detector output, boxes still normalized center form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_index: usize,
    pub confidence: f32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// A raw detection after decoding to pixel space, ready for NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bounds: BoxPx,
    pub confidence: f32,
    pub class: DetectorClass,
}

impl Scored for Candidate {
    fn bounds(&self) -> BoxPx {
        self.bounds
    }

    fn score(&self) -> f32 {
        self.confidence
    }
}

/// CHW float tensor with shape [1, 3, 640, 640].
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Flattened [num_queries, num_classes].
    pub logits: Vec<f32>,
    /// Flattened [num_queries, 4] as normalized (cx, cy, w, h).
    pub pred_boxes: Vec<f32>,
    pub num_queries: usize,
    pub num_classes: usize,
}

pub type InferenceFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelOutput>> + Send + 'a>>;

/// Object-detection backend: tensor in, tensor out. One image per call.
pub trait DetectionEngine: Send + Sync {
    fn infer<'a>(&'a self, tensor: &'a InputTensor) -> InferenceFuture<'a>;
}

pub fn preprocess(image: &RgbaImage) -> InputTensor {
    let resized = image::imageops::resize(
        image,
        INPUT_SIZE,
        INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (idx, pixel) in resized.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel.0[channel] as f32 / 255.0;
            data[channel * plane + idx] = (value - IMAGE_MEAN[channel]) / IMAGE_STD[channel];
        }
    }
    InputTensor {
        data,
        shape: [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
    }
}

/// Picks the best class per query. Scores are taken as emitted by the model.
pub fn decode_output(output: &ModelOutput) -> Result<Vec<RawDetection>> {
    let ModelOutput {
        logits,
        pred_boxes,
        num_queries,
        num_classes,
    } = output;
    if *num_classes == 0 {
        return Err(anyhow!("model output has no classes"));
    }
    if logits.len() != num_queries * num_classes {
        return Err(anyhow!(
            "logits length {} does not match {} queries x {} classes",
            logits.len(),
            num_queries,
            num_classes
        ));
    }
    if pred_boxes.len() != num_queries * 4 {
        return Err(anyhow!(
            "pred_boxes length {} does not match {} queries x 4",
            pred_boxes.len(),
            num_queries
        ));
    }

    let mut detections = Vec::with_capacity(*num_queries);
    for query in 0..*num_queries {
        let scores = &logits[query * num_classes..(query + 1) * num_classes];
        let mut class_index = 0usize;
        let mut confidence = f32::NEG_INFINITY;
        for (idx, score) in scores.iter().enumerate() {
            if *score > confidence {
                confidence = *score;
                class_index = idx;
            }
        }
        let bbox = &pred_boxes[query * 4..query * 4 + 4];
        detections.push(RawDetection {
            class_index,
            confidence,
            cx: bbox[0],
            cy: bbox[1],
            w: bbox[2],
            h: bbox[3],
        });
    }
    Ok(detections)
}

/// Keeps confident text-bearing detections and maps them to pixel space.
/// Boxes are clamped to the image; anything that collapses is dropped.
pub fn to_candidates(
    raw: &[RawDetection],
    min_confidence: f32,
    width: u32,
    height: u32,
) -> Vec<Candidate> {
    raw.iter()
        .filter(|det| det.confidence >= min_confidence)
        .filter_map(|det| {
            let class = DetectorClass::from_index(det.class_index)?;
            if !class.carries_text() {
                return None;
            }
            let bounds = decode_box(det.cx, det.cy, det.w, det.h, width, height)
                .clamp_to(width, height);
            if !bounds.is_valid() {
                return None;
            }
            Some(Candidate {
                bounds,
                confidence: det.confidence,
                class,
            })
        })
        .collect()
}
