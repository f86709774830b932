use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bubble_translator_rust::detector::{DetectorClass, ModelOutput};
use bubble_translator_rust::font::OverlayFont;
use bubble_translator_rust::geometry::{BoxPx, Point, Quad, Rgb};
use bubble_translator_rust::layout::TextMeasure;
use bubble_translator_rust::ocr::{
    OcrFuture, OcrPage, OcrRequest, OcrStrategy, PageBlock, PageLine, PageParagraph, PageWord,
};
use bubble_translator_rust::translation::{TranslateFuture, TranslationRequest};
use bubble_translator_rust::{
    OcrEngine, OverlayPipeline, PipelineConfig, RecordedDetector, TranslationService,
};
use image::{Rgba, RgbaImage};

fn quad(x1: f32, y1: f32, x2: f32, y2: f32) -> Quad {
    [
        Point::new(x1, y1),
        Point::new(x2, y1),
        Point::new(x2, y2),
        Point::new(x1, y2),
    ]
}

struct PageOcr {
    page: OcrPage,
}

impl OcrEngine for PageOcr {
    fn strategy(&self) -> OcrStrategy {
        OcrStrategy::Blocks
    }

    fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a> {
        assert!(request.region.is_none());
        Box::pin(async move { Ok(self.page.clone()) })
    }
}

#[derive(Default, Clone)]
struct StubTranslator {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl TranslationService for StubTranslator {
    fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((request.text.to_string(), request.context.to_string()));
            Ok::<_, anyhow::Error>(match request.text {
                "HELLO WORLD" => "hola mundo".to_string(),
                other => other.to_lowercase(),
            })
        })
    }
}

fn hello_world_page() -> OcrPage {
    let word = |text: &str, q: Quad| PageWord {
        text: text.to_string(),
        quad: q,
        conf: 95.0,
    };
    OcrPage {
        blocks: vec![
            PageBlock {
                quad: quad(160.0, 220.0, 480.0, 260.0),
                conf: 95.0,
                paragraphs: vec![PageParagraph {
                    lines: vec![PageLine {
                        bbox: BoxPx {
                            x1: 160.0,
                            y1: 220.0,
                            x2: 480.0,
                            y2: 260.0,
                        },
                        conf: 95.0,
                        words: vec![
                            word("HELLO", quad(160.0, 220.0, 300.0, 260.0)),
                            word("WORLD", quad(320.0, 220.0, 480.0, 260.0)),
                        ],
                    }],
                }],
            },
            PageBlock {
                quad: quad(100.0, 100.0, 200.0, 130.0),
                conf: 88.0,
                paragraphs: vec![PageParagraph {
                    lines: vec![PageLine {
                        bbox: BoxPx {
                            x1: 100.0,
                            y1: 100.0,
                            x2: 200.0,
                            y2: 130.0,
                        },
                        conf: 88.0,
                        words: vec![word("SECOND", quad(100.0, 100.0, 200.0, 130.0))],
                    }],
                }],
            },
            // Outside every detection; must be ignored.
            PageBlock {
                quad: quad(10.0, 10.0, 60.0, 30.0),
                conf: 90.0,
                paragraphs: vec![PageParagraph {
                    lines: vec![PageLine {
                        bbox: BoxPx {
                            x1: 10.0,
                            y1: 10.0,
                            x2: 60.0,
                            y2: 30.0,
                        },
                        conf: 90.0,
                        words: vec![word("PAGE", quad(10.0, 10.0, 60.0, 30.0))],
                    }],
                }],
            },
        ],
    }
}

/// Gray page, a white bubble over (128,192)-(512,288) and black glyph blocks.
fn comic_page() -> Vec<u8> {
    let mut image = RgbaImage::from_pixel(640, 480, Rgba([120, 120, 120, 255]));
    for y in 192..288 {
        for x in 128..512 {
            image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
        }
    }
    for (x1, x2) in [(165u32, 295u32), (325, 475)] {
        for y in 225..255 {
            for x in x1..x2 {
                image.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
    }
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn detector() -> RecordedDetector {
    // Query 0: text bubble centered on the page. Query 1: a plain bubble.
    RecordedDetector::new(ModelOutput {
        logits: vec![0.05, 0.9, 0.05, 0.95, 0.03, 0.02],
        pred_boxes: vec![0.5, 0.5, 0.6, 0.2, 0.2, 0.2, 0.1, 0.1],
        num_queries: 2,
        num_classes: 3,
    })
}

fn pipeline(
    detector: RecordedDetector,
    translator: StubTranslator,
) -> OverlayPipeline<RecordedDetector, PageOcr, StubTranslator> {
    OverlayPipeline::new(
        detector,
        PageOcr {
            page: hello_world_page(),
        },
        translator,
        OverlayFont::heuristic(),
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn translates_and_lays_out_a_single_bubble() -> Result<()> {
    let translator = StubTranslator::default();
    let pipeline = pipeline(detector(), translator.clone());
    let output = pipeline.process(&comic_page()).await?;

    assert_eq!(output.mime, "image/png");
    assert_eq!((output.width, output.height), (640, 480));
    assert_eq!(output.detections.len(), 1);

    let detection = &output.detections[0];
    assert_eq!(detection.class, DetectorClass::TextBubble);
    assert!((detection.x1 - 128.0).abs() < 1e-3);
    assert!((detection.y1 - 192.0).abs() < 1e-3);
    assert!((detection.x2 - 512.0).abs() < 1e-3);
    assert!((detection.y2 - 288.0).abs() < 1e-3);
    assert_eq!(detection.background_color, Rgb::WHITE);
    assert_eq!(detection.text, "HELLO WORLD");
    assert_eq!(detection.translated_text, "HOLA MUNDO");
    assert_eq!(detection.word_boxes.len(), 2);
    assert!((detection.font_size - 40.0).abs() < 1e-3);

    let layout = detection.layout.as_ref().expect("layout");
    assert!(layout.fits);
    assert!(layout.block_height() <= 96.0);
    let measure = OverlayFont::heuristic();
    for line in &layout.lines {
        assert!(measure.measure(line, layout.font_size as f32) <= 384.0);
    }

    assert_eq!(
        *translator.calls.lock().unwrap(),
        vec![("HELLO WORLD".to_string(), String::new())]
    );

    let composed = image::load_from_memory(&output.image)?.to_rgba8();
    // Former glyph pixels are erased to the bubble color.
    assert_eq!(composed.get_pixel(200, 240).0, [255, 255, 255, 255]);
    // Artwork outside the detection is untouched.
    assert_eq!(composed.get_pixel(20, 20).0, [120, 120, 120, 255]);
    Ok(())
}

#[tokio::test]
async fn identical_input_gives_identical_output() -> Result<()> {
    let input = comic_page();
    let first = pipeline(detector(), StubTranslator::default())
        .process(&input)
        .await?;
    let second = pipeline(detector(), StubTranslator::default())
        .process(&input)
        .await?;
    assert_eq!(first.image, second.image);
    assert_eq!(
        serde_json::to_string(&first.detections)?,
        serde_json::to_string(&second.detections)?
    );
    Ok(())
}

#[tokio::test]
async fn context_follows_confidence_order() -> Result<()> {
    // The centered bubble outranks the upper-left one, so it is translated first.
    let detector = RecordedDetector::new(ModelOutput {
        logits: vec![0.1, 0.8, 0.1, 0.05, 0.9, 0.05],
        pred_boxes: vec![0.25, 0.25, 0.3, 0.2, 0.5, 0.5, 0.6, 0.2],
        num_queries: 2,
        num_classes: 3,
    });
    let translator = StubTranslator::default();
    let output = pipeline(detector, translator.clone())
        .process(&comic_page())
        .await?;

    let texts: Vec<&str> = output
        .detections
        .iter()
        .map(|detection| detection.translated_text.as_str())
        .collect();
    assert_eq!(texts, vec!["HOLA MUNDO", "SECOND"]);
    assert_eq!(
        *translator.calls.lock().unwrap(),
        vec![
            ("HELLO WORLD".to_string(), String::new()),
            ("SECOND".to_string(), "HELLO WORLD ".to_string()),
        ]
    );
    Ok(())
}
