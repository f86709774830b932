use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::json;

use super::{TranslateFuture, TranslationRequest, TranslationService, skip_request};
use crate::languages;
use crate::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};

const DEFAULT_BASE_URL: &str = "https://translation.googleapis.com/language/translate/v2";

/// Google Translate v2. The API has no context parameter, so it is ignored.
#[derive(Debug, Clone)]
pub struct GoogleTranslate {
    key: Option<String>,
}

impl GoogleTranslate {
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }
}

impl TranslationService for GoogleTranslate {
    fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a> {
        Box::pin(async move {
            let key = match self.key.as_deref() {
                Some(key) if !skip_request(Some(key), &request) => key,
                _ => return Ok(request.text.to_string()),
            };

            let body = request_body(&request);
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
                    .with_context(|| "failed to reach Google Translate")?;

                let status = response.status();
                let retry_after = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return extract_translation(&text);
                }
                if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
                    delay = wait_with_backoff("Google Translate", attempt, delay, retry_after).await;
                    continue;
                }
                return Err(anyhow!("Google Translate API error ({}): {}", status, text));
            }
        })
    }
}

fn base_url() -> String {
    std::env::var("GOOGLE_TRANSLATE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn request_body(request: &TranslationRequest<'_>) -> serde_json::Value {
    let source = if languages::is_auto(request.source) {
        serde_json::Value::Null
    } else {
        json!(request.source.trim().to_lowercase())
    };
    json!({
        "q": request.text,
        "source": source,
        "target": request.target.trim().to_lowercase(),
        "format": "text"
    })
}

pub(crate) fn extract_translation(text: &str) -> anyhow::Result<String> {
    let payload: TranslateResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Google Translate response JSON: {}", err))?;
    payload
        .data
        .and_then(|data| data.translations.into_iter().next())
        .map(|translation| translation.translated_text)
        .ok_or_else(|| anyhow!("invalid response structure from Google Translate"))
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: Option<TranslateData>,
}

#[derive(Debug, Deserialize)]
struct TranslateData {
    #[serde(default)]
    translations: Vec<TranslatedItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslatedItem {
    translated_text: String,
}
