use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod codec;
pub mod compositor;
pub mod detector;
pub mod error;
pub mod font;
pub mod geometry;
pub mod languages;
pub mod layout;
pub mod logging;
pub mod ocr;
pub mod pipeline;
pub mod resolver;
mod retry;
pub mod settings;
pub mod translation;

pub use detector::{DetectionEngine, RecordedDetector};
pub use error::OverlayError;
pub use ocr::{OcrEngine, OcrServiceKind};
pub use pipeline::{OverlayOutput, OverlayPipeline, OverlayService, PipelineConfig};
pub use resolver::Detection;
pub use translation::{TranslationService, TranslationServiceKind};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub image_path: String,
    pub detections_path: String,
    pub output_path: Option<String>,
    pub metadata_path: Option<String>,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub ocr_service: Option<String>,
    pub translation_service: Option<String>,
    pub settings_path: Option<String>,
}

/// What a CLI run wrote, echoed back as JSON on stdout.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub output_path: String,
    pub metadata_path: Option<String>,
    #[serde(flatten)]
    pub output: OverlayOutput,
}

pub async fn run(config: Config) -> Result<RunSummary> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config)?;

    if !languages::is_supported(&settings.source_language) {
        warn!(
            "source language '{}' has no OCR mapping; using eng",
            settings.source_language
        );
    }

    let detector = RecordedDetector::load(Path::new(&config.detections_path))?;
    let ocr = ocr::build_ocr(
        settings.ocr_service,
        &settings.source_language,
        settings.google_key(),
    );
    let translator = translation::build_translation_service(
        settings.translation_service,
        settings.translation_key(),
    );
    let font = font::OverlayFont::resolve(
        settings.overlay_font_path.as_deref().map(Path::new),
        settings.overlay_font_family.as_deref(),
    )?;
    let pipeline_config = PipelineConfig {
        source_language: settings.source_language.clone(),
        target_language: settings.target_language.clone(),
        resolve: settings.resolve_options(),
        style: settings.overlay_style()?,
    };
    info!(
        "ocr: {}, translation: {}, {} -> {}",
        settings.ocr_service.as_str(),
        settings.translation_service.as_str(),
        settings.source_language,
        settings.target_language
    );

    let pipeline = OverlayPipeline::new(detector, ocr, translator, font, pipeline_config);
    let service = OverlayService::new(pipeline, settings.max_in_flight);

    let image_path = Path::new(&config.image_path);
    let bytes = fs::read(image_path)
        .with_context(|| format!("failed to read image: {}", image_path.display()))?;
    let output = service.submit(&bytes).await?;

    let output_path = config
        .output_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_output_path(image_path, output.mime));
    fs::write(&output_path, &output.image)
        .with_context(|| format!("failed to write image: {}", output_path.display()))?;

    if let Some(metadata_path) = &config.metadata_path {
        let json = serde_json::to_string_pretty(&output.detections)
            .with_context(|| "failed to serialize detections")?;
        fs::write(metadata_path, json)
            .with_context(|| format!("failed to write metadata: {}", metadata_path))?;
    }

    Ok(RunSummary {
        output_path: output_path.display().to_string(),
        metadata_path: config.metadata_path.clone(),
        output,
    })
}

fn apply_overrides(settings: &mut settings::Settings, config: &Config) -> Result<()> {
    if let Some(source) = non_empty(config.source_lang.as_deref()) {
        settings.source_language = source;
    }
    if let Some(target) = non_empty(config.target_lang.as_deref()) {
        settings.target_language = target;
    }
    if let Some(name) = non_empty(config.ocr_service.as_deref()) {
        settings.ocr_service =
            OcrServiceKind::parse(&name).ok_or_else(|| anyhow!("unknown OCR service '{}'", name))?;
    }
    if let Some(name) = non_empty(config.translation_service.as_deref()) {
        settings.translation_service = TranslationServiceKind::parse(&name)
            .ok_or_else(|| anyhow!("unknown translation service '{}'", name))?;
    }
    if languages::is_auto(&settings.target_language) {
        return Err(anyhow!("target language cannot be AUTO"));
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `page.png` becomes `page.translated.png`, keeping the written format's extension.
fn default_output_path(input: &Path, mime: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("output");
    let ext = match mime {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "png",
    };
    input.with_file_name(format!("{}.translated.{}", stem, ext))
}
