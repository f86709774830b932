use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::compositor::{OverlayStyle, parse_hex_color};
use crate::ocr::OcrServiceKind;
use crate::resolver::ResolveOptions;
use crate::translation::TranslationServiceKind;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");
const GOOGLE_KEY_ENV: &str = "GOOGLE_API_KEY";
const DEEPL_KEY_ENV: &str = "DEEPL_API_KEY";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub ocr_service: OcrServiceKind,
    pub translation_service: TranslationServiceKind,
    pub source_language: String,
    pub target_language: String,
    pub google_api_key: Option<String>,
    pub deepl_api_key: Option<String>,
    pub overlay_font_family: Option<String>,
    pub overlay_font_path: Option<String>,
    pub overlay_outline_width: f32,
    pub overlay_text_color: String,
    pub overlay_outline_color: String,
    pub max_in_flight: usize,
    pub bubble_confidence: f32,
    pub iou_threshold: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_service: OcrServiceKind::Tesseract,
            translation_service: TranslationServiceKind::DeepL,
            source_language: "AUTO".to_string(),
            target_language: "EN".to_string(),
            google_api_key: None,
            deepl_api_key: None,
            overlay_font_family: None,
            overlay_font_path: None,
            overlay_outline_width: 4.0,
            overlay_text_color: "#000000".to_string(),
            overlay_outline_color: "#ffffff".to_string(),
            max_in_flight: 1,
            bubble_confidence: 0.5,
            iou_threshold: 0.5,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    services: Option<ServiceSettings>,
    languages: Option<LanguageSettings>,
    keys: Option<KeySettings>,
    overlay: Option<OverlaySettings>,
    pipeline: Option<PipelineSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSettings {
    ocr: Option<String>,
    translation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageSettings {
    source: Option<String>,
    target: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KeySettings {
    google: Option<String>,
    deepl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlaySettings {
    font_family: Option<String>,
    font_path: Option<String>,
    outline_width: Option<f32>,
    text_color: Option<String>,
    outline_color: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineSettings {
    max_in_flight: Option<usize>,
    bubble_confidence: Option<f32>,
    iou_threshold: Option<f32>,
}

/// Built-in defaults, then `./settings.toml`, `./settings.local.toml`, the
/// same two files under `$HOME/.bubble-translator-rust`, then `extra_path`.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    let defaults: SettingsFile =
        toml::from_str(DEFAULT_SETTINGS_TOML).with_context(|| "failed to parse built-in settings")?;
    settings.merge(defaults)?;
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            settings
                .merge_file(&path)
                .with_context(|| format!("invalid settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        let parsed: SettingsFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(services) = incoming.services {
            if let Some(name) = non_empty(services.ocr) {
                self.ocr_service = OcrServiceKind::parse(&name)
                    .ok_or_else(|| anyhow!("unknown OCR service '{}'", name))?;
            }
            if let Some(name) = non_empty(services.translation) {
                self.translation_service = TranslationServiceKind::parse(&name)
                    .ok_or_else(|| anyhow!("unknown translation service '{}'", name))?;
            }
        }
        if let Some(languages) = incoming.languages {
            if let Some(source) = non_empty(languages.source) {
                self.source_language = source;
            }
            if let Some(target) = non_empty(languages.target) {
                self.target_language = target;
            }
        }
        if let Some(keys) = incoming.keys {
            if let Some(key) = non_empty(keys.google) {
                self.google_api_key = Some(key);
            }
            if let Some(key) = non_empty(keys.deepl) {
                self.deepl_api_key = Some(key);
            }
        }
        if let Some(overlay) = incoming.overlay {
            if let Some(family) = non_empty(overlay.font_family) {
                self.overlay_font_family = Some(family);
            }
            if let Some(path) = non_empty(overlay.font_path) {
                self.overlay_font_path = Some(path);
            }
            if let Some(width) = overlay.outline_width
                && width >= 0.0
            {
                self.overlay_outline_width = width;
            }
            if let Some(color) = non_empty(overlay.text_color) {
                self.overlay_text_color = color;
            }
            if let Some(color) = non_empty(overlay.outline_color) {
                self.overlay_outline_color = color;
            }
        }
        if let Some(pipeline) = incoming.pipeline {
            if let Some(limit) = pipeline.max_in_flight
                && limit > 0
            {
                self.max_in_flight = limit;
            }
            if let Some(value) = pipeline.bubble_confidence
                && (0.0..=1.0).contains(&value)
            {
                self.bubble_confidence = value;
            }
            if let Some(value) = pipeline.iou_threshold
                && (0.0..=1.0).contains(&value)
            {
                self.iou_threshold = value;
            }
        }
        Ok(())
    }

    /// Configured key, else the `GOOGLE_API_KEY` environment variable.
    pub fn google_key(&self) -> Option<String> {
        self.google_api_key.clone().or_else(|| env_key(GOOGLE_KEY_ENV))
    }

    pub fn deepl_key(&self) -> Option<String> {
        self.deepl_api_key.clone().or_else(|| env_key(DEEPL_KEY_ENV))
    }

    pub fn translation_key(&self) -> Option<String> {
        match self.translation_service {
            TranslationServiceKind::DeepL => self.deepl_key(),
            TranslationServiceKind::GoogleTranslate => self.google_key(),
        }
    }

    pub fn overlay_style(&self) -> Result<OverlayStyle> {
        Ok(OverlayStyle {
            text_color: parse_hex_color(&self.overlay_text_color)
                .with_context(|| "invalid overlay.text_color")?,
            outline_color: parse_hex_color(&self.overlay_outline_color)
                .with_context(|| "invalid overlay.outline_color")?,
            outline_width: self.overlay_outline_width,
        })
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            bubble_confidence: self.bubble_confidence,
            iou_threshold: self.iou_threshold,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_key(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".bubble-translator-rust"))
        }
    })
}
