use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::codec;
use crate::compositor::{OverlayStyle, compose};
use crate::detector::{DetectionEngine, decode_output, preprocess};
use crate::error::OverlayError;
use crate::font::OverlayFont;
use crate::layout::fit_text;
use crate::ocr::{OcrEngine, OcrPage, OcrRequest, OcrStrategy};
use crate::resolver::{Detection, ResolveOptions, resolve_regions, select_candidates};
use crate::translation::{TranslationService, translate_regions};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_language: String,
    pub target_language: String,
    pub resolve: ResolveOptions,
    pub style: OverlayStyle,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_language: "AUTO".to_string(),
            target_language: "EN".to_string(),
            resolve: ResolveOptions::default(),
            style: OverlayStyle::default(),
        }
    }
}

/// Composite image plus the regions drawn on it, in resolution order.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayOutput {
    #[serde(skip)]
    pub image: Vec<u8>,
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

/// One image in, one composited image out. Holds the backing services, which
/// are built once and shared by every invocation.
pub struct OverlayPipeline<D, O, T> {
    detector: D,
    ocr: O,
    translator: T,
    font: OverlayFont,
    config: PipelineConfig,
}

impl<D, O, T> OverlayPipeline<D, O, T>
where
    D: DetectionEngine,
    O: OcrEngine,
    T: TranslationService,
{
    pub fn new(detector: D, ocr: O, translator: T, font: OverlayFont, config: PipelineConfig) -> Self {
        Self {
            detector,
            ocr,
            translator,
            font,
            config,
        }
    }

    pub async fn process(&self, bytes: &[u8]) -> Result<OverlayOutput> {
        let decoded = codec::decode_image(bytes)?;
        let image = &decoded.image;
        let (width, height) = image.dimensions();
        debug!("processing {}x{} {}", width, height, decoded.mime);

        let tensor = preprocess(image);
        let full_page = async {
            if self.ocr.strategy() != OcrStrategy::Blocks {
                return None;
            }
            let request = OcrRequest {
                image,
                region: None,
            };
            match self.ocr.recognize(request).await {
                Ok(page) => Some(page),
                Err(err) => {
                    warn!("full-page OCR failed: {:#}", err);
                    Some(OcrPage::default())
                }
            }
        };
        let (output, page) = tokio::join!(self.detector.infer(&tensor), full_page);
        let output = output.context(OverlayError::Inference)?;
        let raw = decode_output(&output).context(OverlayError::Inference)?;

        let candidates = select_candidates(&raw, width, height, &self.config.resolve);
        let mut detections = resolve_regions(image, &candidates, page, &self.ocr).await;
        translate_regions(
            &self.translator,
            &mut detections,
            &self.config.source_language,
            &self.config.target_language,
        )
        .await;
        self.layout_regions(&mut detections);

        let composed = compose(image, &detections, &self.font, &self.config.style)?;
        let (bytes, mime) = codec::encode_image(&composed, decoded.mime)?;
        info!(
            "overlaid {} regions ({} with text)",
            detections.len(),
            detections
                .iter()
                .filter(|detection| !detection.translated_text.is_empty())
                .count()
        );
        Ok(OverlayOutput {
            image: bytes,
            mime,
            width,
            height,
            detections,
        })
    }

    fn layout_regions(&self, detections: &mut [Detection]) {
        for detection in detections.iter_mut() {
            if detection.translated_text.is_empty() {
                continue;
            }
            let bounds = detection.bounds();
            let layout = fit_text(
                &detection.translated_text,
                bounds.width(),
                bounds.height(),
                detection.font_size,
                &self.font,
            );
            detection.layout = Some(layout);
        }
    }
}

/// Admission gate in front of a shared pipeline. At most `max_in_flight`
/// images are processed at once; waiters are admitted in arrival order.
pub struct OverlayService<D, O, T> {
    pipeline: Arc<OverlayPipeline<D, O, T>>,
    admission: Arc<Semaphore>,
}

impl<D, O, T> Clone for OverlayService<D, O, T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            admission: Arc::clone(&self.admission),
        }
    }
}

impl<D, O, T> OverlayService<D, O, T>
where
    D: DetectionEngine,
    O: OcrEngine,
    T: TranslationService,
{
    pub fn new(pipeline: OverlayPipeline<D, O, T>, max_in_flight: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            admission: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub async fn submit(&self, bytes: &[u8]) -> Result<OverlayOutput> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| anyhow!("overlay service is shut down"))?;
        self.pipeline.process(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{InferenceFuture, InputTensor, ModelOutput};
    use crate::ocr::OcrFuture;
    use crate::translation::{TranslateFuture, TranslationRequest};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowDetector {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    impl SlowDetector {
        fn new(fail: bool) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl DetectionEngine for SlowDetector {
        fn infer<'a>(&'a self, _tensor: &'a InputTensor) -> InferenceFuture<'a> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                if self.fail {
                    return Err(anyhow!("session not loaded"));
                }
                Ok(ModelOutput {
                    logits: Vec::new(),
                    pred_boxes: Vec::new(),
                    num_queries: 0,
                    num_classes: 3,
                })
            })
        }
    }

    struct NoOcr;

    impl OcrEngine for NoOcr {
        fn strategy(&self) -> OcrStrategy {
            OcrStrategy::Blocks
        }

        fn recognize<'a>(&'a self, _request: OcrRequest<'a>) -> OcrFuture<'a> {
            Box::pin(async { Ok(OcrPage::default()) })
        }
    }

    struct Echo;

    impl TranslationService for Echo {
        fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a> {
            Box::pin(async move { Ok(request.text.to_string()) })
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn pipeline(fail: bool) -> OverlayPipeline<SlowDetector, NoOcr, Echo> {
        OverlayPipeline::new(
            SlowDetector::new(fail),
            NoOcr,
            Echo,
            OverlayFont::heuristic(),
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn single_admission_serializes_invocations() {
        let service = OverlayService::new(pipeline(false), 1);
        let input = png(32, 32);
        let (a, b, c) = tokio::join!(
            service.submit(&input),
            service.submit(&input),
            service.submit(&input)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(service.pipeline.detector.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wider_admission_overlaps_invocations() {
        let service = OverlayService::new(pipeline(false), 3);
        let input = png(32, 32);
        let (a, b, c) = tokio::join!(
            service.submit(&input),
            service.submit(&input),
            service.submit(&input)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(service.pipeline.detector.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn inference_failure_is_fatal_and_tagged() {
        let err = pipeline(true).process(&png(16, 16)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<OverlayError>(),
            Some(&OverlayError::Inference)
        );
    }

    #[tokio::test]
    async fn no_detections_returns_the_image_unchanged() {
        let input = png(16, 16);
        let output = pipeline(false).process(&input).await.unwrap();
        assert!(output.detections.is_empty());
        assert_eq!(output.mime, "image/png");
        let decoded = image::load_from_memory(&output.image).unwrap().to_rgba8();
        assert_eq!(decoded, image::load_from_memory(&input).unwrap().to_rgba8());
    }
}
