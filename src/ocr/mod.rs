mod google;
mod preprocess;
mod tesseract;
mod text;

use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::detector::DetectorClass;
use crate::geometry::{BoxPx, Quad, Rgb};

pub use google::GoogleVisionOcr;
pub use preprocess::prepare_region;
pub use tesseract::{TesseractOcr, list_tesseract_languages};

/// Word geometry attached to a detection, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordBox {
    pub text: String,
    pub quad: Quad,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A text block produced by a full-page OCR pass, claimable by one detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrBlock {
    pub text: String,
    pub quad: Quad,
    pub font_size: f32,
    pub word_boxes: Vec<WordBox>,
}

impl OcrBlock {
    pub fn bounds(&self) -> BoxPx {
        BoxPx::from_quad(&self.quad)
    }

    /// Midpoint of the top-left and bottom-right corners.
    pub fn centroid(&self) -> crate::geometry::Point {
        crate::geometry::Point::new(
            (self.quad[0].x + self.quad[2].x) / 2.0,
            (self.quad[0].y + self.quad[2].y) / 2.0,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OcrPage {
    pub blocks: Vec<PageBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageBlock {
    pub quad: Quad,
    pub conf: f32,
    pub paragraphs: Vec<PageParagraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageParagraph {
    pub lines: Vec<PageLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLine {
    pub bbox: BoxPx,
    pub conf: f32,
    pub words: Vec<PageWord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageWord {
    pub text: String,
    pub quad: Quad,
    pub conf: f32,
}

impl OcrPage {
    pub fn lines(&self) -> impl Iterator<Item = &PageLine> {
        self.blocks
            .iter()
            .flat_map(|block| block.paragraphs.iter())
            .flat_map(|paragraph| paragraph.lines.iter())
    }

    pub fn words(&self) -> impl Iterator<Item = &PageWord> {
        self.lines().flat_map(|line| line.words.iter())
    }

    /// Words joined by single spaces across every line.
    pub fn text(&self) -> String {
        self.words()
            .map(|word| word.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Flattens the page into claimable blocks for the block-assignment strategy.
    pub fn into_blocks(self) -> Vec<OcrBlock> {
        self.blocks
            .into_iter()
            .map(|block| {
                let words: Vec<PageWord> = block
                    .paragraphs
                    .into_iter()
                    .flat_map(|paragraph| paragraph.lines.into_iter())
                    .flat_map(|line| line.words.into_iter())
                    .collect();
                let font_size = if words.is_empty() {
                    0.0
                } else {
                    words
                        .iter()
                        .map(|word| (word.quad[3].y - word.quad[0].y).abs())
                        .sum::<f32>()
                        / words.len() as f32
                };
                let joined = words
                    .iter()
                    .map(|word| word.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                OcrBlock {
                    text: text::tidy_block_text(&joined),
                    quad: block.quad,
                    font_size,
                    word_boxes: words
                        .into_iter()
                        .map(|word| WordBox {
                            text: word.text,
                            quad: word.quad,
                            confidence: None,
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrStrategy {
    /// One full-page pass; blocks are claimed by the detection containing them.
    Blocks,
    /// One pass per detection over an upscaled crop.
    RegionCrop,
}

/// Extra context for a region crop so the engine can clean it up.
#[derive(Debug, Clone, Copy)]
pub struct RegionHint {
    pub class: DetectorClass,
    pub background: Rgb,
}

pub struct OcrRequest<'a> {
    pub image: &'a RgbaImage,
    pub region: Option<RegionHint>,
}

pub type OcrFuture<'a> = Pin<Box<dyn Future<Output = Result<OcrPage>> + Send + 'a>>;

/// OCR backend: image (full page or crop) in, hierarchical page out.
pub trait OcrEngine: Send + Sync {
    fn strategy(&self) -> OcrStrategy;
    fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrServiceKind {
    Tesseract,
    GoogleCloudVision,
}

impl OcrServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrServiceKind::Tesseract => "tesseract",
            OcrServiceKind::GoogleCloudVision => "google_cloud_vision",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "tesseract" => Some(OcrServiceKind::Tesseract),
            "google_cloud_vision" | "googlecloudvision" | "google" | "gcv" => {
                Some(OcrServiceKind::GoogleCloudVision)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum OcrImpl {
    Tesseract(TesseractOcr),
    GoogleVision(GoogleVisionOcr),
}

impl OcrEngine for OcrImpl {
    fn strategy(&self) -> OcrStrategy {
        match self {
            OcrImpl::Tesseract(engine) => engine.strategy(),
            OcrImpl::GoogleVision(engine) => engine.strategy(),
        }
    }

    fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a> {
        match self {
            OcrImpl::Tesseract(engine) => engine.recognize(request),
            OcrImpl::GoogleVision(engine) => engine.recognize(request),
        }
    }
}

pub fn build_ocr(kind: OcrServiceKind, source_lang: &str, google_key: Option<String>) -> OcrImpl {
    match kind {
        OcrServiceKind::Tesseract => OcrImpl::Tesseract(TesseractOcr::new(source_lang)),
        OcrServiceKind::GoogleCloudVision => {
            OcrImpl::GoogleVision(GoogleVisionOcr::new(google_key, source_lang))
        }
    }
}
