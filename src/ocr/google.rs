use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use tracing::{debug, warn};

use super::{
    OcrEngine, OcrFuture, OcrPage, OcrRequest, OcrStrategy, PageBlock, PageLine, PageParagraph,
    PageWord,
};
use crate::geometry::{BoxPx, Point, Quad};
use crate::languages;
use crate::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};

const DEFAULT_BASE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Full-page OCR through Google Cloud Vision TEXT_DETECTION.
#[derive(Debug, Clone)]
pub struct GoogleVisionOcr {
    key: Option<String>,
    language_hint: Option<String>,
}

impl GoogleVisionOcr {
    pub fn new(key: Option<String>, source_lang: &str) -> Self {
        let language_hint = if languages::is_auto(source_lang) {
            None
        } else {
            Some(source_lang.trim().to_lowercase())
        };
        Self {
            key: key.filter(|value| !value.trim().is_empty()),
            language_hint,
        }
    }

    async fn annotate(&self, request: OcrRequest<'_>) -> Result<OcrPage> {
        let Some(key) = self.key.as_deref() else {
            warn!("Google Cloud Vision API key is missing; skipping OCR");
            return Ok(OcrPage::default());
        };

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(request.image.clone())
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .with_context(|| "failed to encode image for Google Cloud Vision")?;

        let mut item = json!({
            "image": { "content": BASE64.encode(&png) },
            "features": [{ "type": "TEXT_DETECTION" }]
        });
        if let Some(hint) = &self.language_hint {
            item["imageContext"] = json!({ "languageHints": [hint] });
        }
        let body = json!({ "requests": [item] });

        let client = reqwest::Client::new();
        let url = format!("{}?key={}", base_url(), key);
        let mut attempt = 0usize;
        let mut delay = RATE_LIMIT_BASE_DELAY;
        loop {
            attempt += 1;
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .with_context(|| "failed to reach Google Cloud Vision")?;

            let status = response.status();
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            if status.is_success() {
                let page = parse_annotate_response(&text)?;
                debug!("Google Cloud Vision returned {} blocks", page.blocks.len());
                return Ok(page);
            }
            if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
                delay = wait_with_backoff("Google Cloud Vision", attempt, delay, retry_after).await;
                continue;
            }
            return Err(anyhow!("Google Cloud Vision API error ({}): {}", status, text));
        }
    }
}

impl OcrEngine for GoogleVisionOcr {
    fn strategy(&self) -> OcrStrategy {
        OcrStrategy::Blocks
    }

    fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a> {
        Box::pin(self.annotate(request))
    }
}

fn base_url() -> String {
    std::env::var("GOOGLE_VISION_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

/// A response without `fullTextAnnotation` means nothing was found.
pub(crate) fn parse_annotate_response(text: &str) -> Result<OcrPage> {
    let payload: AnnotateResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Google Cloud Vision response JSON: {}", err))?;
    let Some(annotation) = payload
        .responses
        .into_iter()
        .next()
        .and_then(|response| response.full_text_annotation)
    else {
        return Ok(OcrPage::default());
    };
    let Some(page) = annotation.pages.into_iter().next() else {
        return Ok(OcrPage::default());
    };

    let blocks = page
        .blocks
        .into_iter()
        .map(|block| PageBlock {
            quad: block.bounding_box.to_quad(),
            conf: block.confidence * 100.0,
            paragraphs: block
                .paragraphs
                .into_iter()
                .map(|paragraph| {
                    let quad = paragraph.bounding_box.to_quad();
                    PageParagraph {
                        lines: vec![PageLine {
                            bbox: BoxPx::from_quad(&quad),
                            conf: paragraph.confidence * 100.0,
                            words: paragraph
                                .words
                                .into_iter()
                                .map(|word| PageWord {
                                    text: word
                                        .symbols
                                        .iter()
                                        .map(|symbol| symbol.text.as_str())
                                        .collect(),
                                    quad: word.bounding_box.to_quad(),
                                    conf: word.confidence * 100.0,
                                })
                                .collect(),
                        }],
                    }
                })
                .collect(),
        })
        .collect();
    Ok(OcrPage { blocks })
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResult {
    full_text_annotation: Option<TextAnnotation>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    pages: Vec<VisionPage>,
}

#[derive(Debug, Deserialize)]
struct VisionPage {
    #[serde(default)]
    blocks: Vec<VisionBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionBlock {
    #[serde(default)]
    bounding_box: BoundingPoly,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    paragraphs: Vec<VisionParagraph>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionParagraph {
    #[serde(default)]
    bounding_box: BoundingPoly,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<VisionWord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionWord {
    #[serde(default)]
    bounding_box: BoundingPoly,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    symbols: Vec<VisionSymbol>,
}

#[derive(Debug, Deserialize)]
struct VisionSymbol {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Vision omits zero coordinates.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

impl BoundingPoly {
    fn to_quad(&self) -> Quad {
        let mut quad = [Point::new(0.0, 0.0); 4];
        for (slot, vertex) in quad.iter_mut().zip(self.vertices.iter()) {
            *slot = Point::new(vertex.x, vertex.y);
        }
        quad
    }
}
