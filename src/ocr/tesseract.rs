use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, RgbaImage};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use super::{
    OcrEngine, OcrFuture, OcrPage, OcrRequest, OcrStrategy, PageBlock, PageLine, PageParagraph,
    PageWord, RegionHint, prepare_region,
};
use crate::detector::DetectorClass;
use crate::geometry::{BoxPx, Point, Quad};
use crate::languages::tesseract_language;

/// Tesseract page segmentation mode "assume a single uniform block of text".
const PSM_SINGLE_BLOCK: u32 = 6;
const FREE_TEXT_MIN_BLOCK_CONF: f32 = 10.0;
const CHAR_BLACKLIST: &str = "*#$¥%£&©®<=>@[\\/]^_{|}~0123456789¢€₹₩₽₺±×÷∞≈≠…•§¶°†‡\"‹›«»–—‒™℠µ←→↑↓↔↕☑☐☒★☆";

/// Region-crop OCR through the `tesseract` command line tool.
#[derive(Debug)]
pub struct TesseractOcr {
    program: PathBuf,
    requested: String,
    resolved: Arc<OnceLock<Result<String, String>>>,
}

impl TesseractOcr {
    pub fn new(source_lang: &str) -> Self {
        Self {
            program: PathBuf::from("tesseract"),
            requested: tesseract_language(source_lang).to_string(),
            resolved: Arc::new(OnceLock::new()),
        }
    }

    /// Runs a different tesseract executable instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl OcrEngine for TesseractOcr {
    fn strategy(&self) -> OcrStrategy {
        OcrStrategy::RegionCrop
    }

    fn recognize<'a>(&'a self, request: OcrRequest<'a>) -> OcrFuture<'a> {
        let program = self.program.clone();
        let requested = self.requested.clone();
        let resolved = Arc::clone(&self.resolved);
        let image = request.image.clone();
        let region = request.region;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let languages = resolve_languages(&program, &requested, &resolved)?;
                recognize_blocking(&program, &languages, &image, region)
            })
            .await
            .map_err(|err| anyhow!("tesseract task failed: {}", err))?
        })
    }
}

/// Checked against the installed traineddata on first use only.
fn resolve_languages(
    program: &Path,
    requested: &str,
    resolved: &OnceLock<Result<String, String>>,
) -> Result<String> {
    let resolved = resolved.get_or_init(|| {
        normalize_ocr_languages(program, requested).map_err(|err| err.to_string())
    });
    match resolved {
        Ok(languages) => Ok(languages.clone()),
        Err(message) => Err(anyhow!(message.clone())),
    }
}

fn recognize_blocking(
    program: &Path,
    languages: &str,
    image: &RgbaImage,
    region: Option<RegionHint>,
) -> Result<OcrPage> {
    let prepared = match region {
        Some(hint) => DynamicImage::ImageLuma8(prepare_region(image, hint)),
        None => DynamicImage::ImageRgba8(image.clone()).grayscale(),
    };

    let mut tmp = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .with_context(|| "failed to create temp file for OCR")?;
    prepared
        .write_to(&mut tmp, image::ImageFormat::Png)
        .with_context(|| "failed to write temp image for OCR")?;
    tmp.flush()
        .with_context(|| "failed to flush temp image for OCR")?;

    let tsv = run_tesseract_tsv(program, tmp.path(), languages, PSM_SINGLE_BLOCK)?;
    let mut page = parse_tsv_page(&tsv);
    drop_faint_blocks(&mut page, region.map(|hint| hint.class));
    debug!("tesseract recognized {} blocks", page.blocks.len());
    Ok(page)
}

/// Free-text crops pick up screentone and art; near-zero confidence blocks
/// there are noise.
fn drop_faint_blocks(page: &mut OcrPage, class: Option<DetectorClass>) {
    if class == Some(DetectorClass::TextFree) {
        page.blocks
            .retain(|block| block.conf >= FREE_TEXT_MIN_BLOCK_CONF);
    }
}

pub fn list_tesseract_languages() -> Result<Vec<String>> {
    list_languages(Path::new("tesseract"))
}

fn list_languages(program: &Path) -> Result<Vec<String>> {
    let output = Command::new(program)
        .arg("--list-langs")
        .output()
        .with_context(|| "failed to run tesseract --list-langs")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut langs = Vec::new();
    for (idx, line) in stdout.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        let value = line.trim();
        if !value.is_empty() {
            langs.push(value.to_string());
        }
    }
    Ok(langs)
}

fn normalize_ocr_languages(program: &Path, requested: &str) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr languages is empty"));
    }

    let available = match list_languages(program) {
        Ok(list) => list,
        Err(_) => return Ok(trimmed.to_string()),
    };

    if available.iter().any(|value| value == trimmed) {
        return Ok(trimmed.to_string());
    }
    if available.iter().any(|value| value == "eng") {
        warn!(
            "ocr language '{}' not available (available: {}); using eng",
            trimmed,
            available.join(", ")
        );
        return Ok("eng".to_string());
    }
    Err(anyhow!(
        "ocr language '{}' not available (available: {})",
        trimmed,
        available.join(", ")
    ))
}

fn run_tesseract_tsv(program: &Path, path: &Path, languages: &str, psm: u32) -> Result<String> {
    let output = Command::new(program)
        .arg(path)
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--psm")
        .arg(psm.to_string())
        .arg("-c")
        .arg("preserve_interword_spaces=1")
        .arg("-c")
        .arg(format!("tessedit_char_blacklist={}", CHAR_BLACKLIST))
        .arg("tsv")
        .output()
        .with_context(|| "failed to run tesseract (is it installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Default)]
struct LineAcc {
    bbox: Option<BoxPx>,
    words: Vec<PageWord>,
}

#[derive(Default)]
struct BlockAcc {
    bbox: Option<BoxPx>,
    paragraphs: BTreeMap<i32, BTreeMap<i32, LineAcc>>,
}

/// Rebuilds the block / paragraph / line / word tree from tesseract's TSV rows.
pub(super) fn parse_tsv_page(tsv: &str) -> OcrPage {
    let mut blocks: BTreeMap<(i32, i32), BlockAcc> = BTreeMap::new();

    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 11 {
            continue;
        }
        let level: i32 = cols[0].parse().unwrap_or(0);
        let page_num: i32 = cols[1].parse().unwrap_or(0);
        let block_num: i32 = cols[2].parse().unwrap_or(0);
        let par_num: i32 = cols[3].parse().unwrap_or(0);
        let line_num: i32 = cols[4].parse().unwrap_or(0);
        let left: f32 = cols[6].parse().unwrap_or(0.0);
        let top: f32 = cols[7].parse().unwrap_or(0.0);
        let width: f32 = cols[8].parse().unwrap_or(0.0);
        let height: f32 = cols[9].parse().unwrap_or(0.0);
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let text = cols.get(11).map(|value| value.trim()).unwrap_or("");
        let bbox = BoxPx {
            x1: left,
            y1: top,
            x2: left + width,
            y2: top + height,
        };

        let block = blocks.entry((page_num, block_num)).or_default();
        match level {
            2 => block.bbox = Some(bbox),
            4 => {
                block
                    .paragraphs
                    .entry(par_num)
                    .or_default()
                    .entry(line_num)
                    .or_default()
                    .bbox = Some(bbox);
            }
            5 => {
                if text.is_empty() || conf < 0.0 {
                    continue;
                }
                block
                    .paragraphs
                    .entry(par_num)
                    .or_default()
                    .entry(line_num)
                    .or_default()
                    .words
                    .push(PageWord {
                        text: text.to_string(),
                        quad: quad_from_box(&bbox),
                        conf,
                    });
            }
            _ => {}
        }
    }

    let mut page = OcrPage::default();
    for (_, block) in blocks {
        let mut confs = Vec::new();
        let mut paragraphs = Vec::new();
        for (_, lines) in block.paragraphs {
            let mut out_lines = Vec::new();
            for (_, line) in lines {
                if line.words.is_empty() {
                    continue;
                }
                let line_conf = mean(line.words.iter().map(|word| word.conf));
                confs.extend(line.words.iter().map(|word| word.conf));
                let bbox = line
                    .bbox
                    .unwrap_or_else(|| words_bounds(&line.words));
                out_lines.push(PageLine {
                    bbox,
                    conf: line_conf,
                    words: line.words,
                });
            }
            if !out_lines.is_empty() {
                paragraphs.push(PageParagraph { lines: out_lines });
            }
        }
        if paragraphs.is_empty() {
            continue;
        }
        let bounds = block.bbox.unwrap_or_else(|| {
            let words: Vec<PageWord> = paragraphs
                .iter()
                .flat_map(|paragraph| paragraph.lines.iter())
                .flat_map(|line| line.words.iter().cloned())
                .collect();
            words_bounds(&words)
        });
        page.blocks.push(PageBlock {
            quad: quad_from_box(&bounds),
            conf: mean(confs.into_iter()),
            paragraphs,
        });
    }
    page
}

fn quad_from_box(bbox: &BoxPx) -> Quad {
    [
        Point::new(bbox.x1, bbox.y1),
        Point::new(bbox.x2, bbox.y1),
        Point::new(bbox.x2, bbox.y2),
        Point::new(bbox.x1, bbox.y2),
    ]
}

fn words_bounds(words: &[PageWord]) -> BoxPx {
    let mut out = BoxPx::from_quad(&words[0].quad);
    for word in &words[1..] {
        let other = BoxPx::from_quad(&word.quad);
        out.x1 = out.x1.min(other.x1);
        out.y1 = out.y1.min(other.y1);
        out.x2 = out.x2.max(other.x2);
        out.y2 = out.y2.max(other.y2);
    }
    out
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let mut total = 0.0;
    let mut count = 0usize;
    for value in values {
        total += value;
        count += 1;
    }
    if count == 0 { 0.0 } else { total / count as f32 }
}
