use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

use crate::languages;
use crate::resolver::Detection;

mod deepl;
mod google;

pub use deepl::DeepL;
pub use google::GoogleTranslate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationServiceKind {
    DeepL,
    GoogleTranslate,
}

impl TranslationServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationServiceKind::DeepL => "deepl",
            TranslationServiceKind::GoogleTranslate => "google_translate",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "deepl" => Some(TranslationServiceKind::DeepL),
            "google_translate" | "googletranslate" | "google" => {
                Some(TranslationServiceKind::GoogleTranslate)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub text: &'a str,
    /// Source text of every earlier region on the page.
    pub context: &'a str,
    pub source: &'a str,
    pub target: &'a str,
}

pub type TranslateFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

pub trait TranslationService: Send + Sync {
    fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a>;
}

#[derive(Debug, Clone)]
pub enum TranslationServiceImpl {
    DeepL(DeepL),
    GoogleTranslate(GoogleTranslate),
}

impl TranslationService for TranslationServiceImpl {
    fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a> {
        match self {
            TranslationServiceImpl::DeepL(service) => service.translate(request),
            TranslationServiceImpl::GoogleTranslate(service) => service.translate(request),
        }
    }
}

pub fn build_translation_service(
    kind: TranslationServiceKind,
    key: Option<String>,
) -> TranslationServiceImpl {
    match kind {
        TranslationServiceKind::DeepL => TranslationServiceImpl::DeepL(DeepL::new(key)),
        TranslationServiceKind::GoogleTranslate => {
            TranslationServiceImpl::GoogleTranslate(GoogleTranslate::new(key))
        }
    }
}

/// Requests that are answered with their own text instead of a network call.
pub(crate) fn skip_request(key: Option<&str>, request: &TranslationRequest<'_>) -> bool {
    if request.text.trim().is_empty() {
        return true;
    }
    if key.is_none_or(|key| key.trim().is_empty()) {
        debug!("translation skipped: missing API key");
        return true;
    }
    if languages::same_language(request.source, request.target) {
        debug!("translation skipped: source and target are both {}", request.target);
        return true;
    }
    false
}

/// Translates every region in order, feeding each call the source text of the
/// regions before it. A failed call keeps the source text for that region.
pub async fn translate_regions<S>(
    service: &S,
    detections: &mut [Detection],
    source: &str,
    target: &str,
) where
    S: TranslationService + ?Sized,
{
    let mut context = String::new();
    for (idx, detection) in detections.iter_mut().enumerate() {
        if detection.text.is_empty() {
            detection.translated_text.clear();
            continue;
        }
        let request = TranslationRequest {
            text: &detection.text,
            context: &context,
            source,
            target,
        };
        let translated = match service.translate(request).await {
            Ok(value) => value.to_uppercase(),
            Err(err) => {
                warn!("translation failed for region {}: {:#}", idx, err);
                detection.text.clone()
            }
        };
        info!("region {}: {:?} -> {:?}", idx, detection.text, translated);
        context.push_str(&detection.text);
        context.push(' ');
        detection.translated_text = translated;
    }
}
