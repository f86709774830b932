use anyhow::{Context, anyhow};
use serde::Deserialize;

use super::{TranslateFuture, TranslationRequest, TranslationService, skip_request};
use crate::languages;
use crate::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};

const FREE_BASE_URL: &str = "https://api-free.deepl.com/v2/translate";
const PRO_BASE_URL: &str = "https://api.deepl.com/v2/translate";

#[derive(Debug, Clone)]
pub struct DeepL {
    key: Option<String>,
}

impl DeepL {
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }
}

impl TranslationService for DeepL {
    fn translate<'a>(&'a self, request: TranslationRequest<'a>) -> TranslateFuture<'a> {
        Box::pin(async move {
            let key = match self.key.as_deref() {
                Some(key) if !skip_request(Some(key), &request) => key,
                _ => return Ok(request.text.to_string()),
            };

            let mut form = vec![
                ("text", request.text.to_string()),
                ("context", request.context.to_string()),
                ("target_lang", languages::normalize_code(request.target)),
            ];
            if !languages::is_auto(request.source) {
                form.push(("source_lang", languages::normalize_code(request.source)));
            }

            let client = reqwest::Client::new();
            let url = base_url(key);
            let mut attempt = 0usize;
            let mut delay = RATE_LIMIT_BASE_DELAY;
            loop {
                attempt += 1;
                let response = client
                    .post(&url)
                    .header("Authorization", format!("DeepL-Auth-Key {}", key))
                    .form(&form)
                    .send()
                    .await
                    .with_context(|| "failed to reach DeepL")?;

                let status = response.status();
                let retry_after = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return extract_translation(&text);
                }
                if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
                    delay = wait_with_backoff("DeepL", attempt, delay, retry_after).await;
                    continue;
                }
                return Err(anyhow!(
                    "DeepL API error ({}): {}",
                    status,
                    extract_deepl_error(&text).unwrap_or(text)
                ));
            }
        })
    }
}

/// Free-plan keys carry a `:fx` suffix and must use the free host.
fn base_url(key: &str) -> String {
    if let Ok(url) = std::env::var("DEEPL_BASE_URL") {
        return url;
    }
    if key.trim().ends_with(":fx") {
        FREE_BASE_URL.to_string()
    } else {
        PRO_BASE_URL.to_string()
    }
}

pub(crate) fn extract_translation(text: &str) -> anyhow::Result<String> {
    let payload: DeepLResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse DeepL response JSON: {}", err))?;
    payload
        .translations
        .into_iter()
        .next()
        .map(|translation| translation.text)
        .ok_or_else(|| anyhow!("DeepL returned no translations"))
}

fn extract_deepl_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.message.filter(|message| !message.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct DeepLResponse {
    #[serde(default)]
    translations: Vec<DeepLTranslation>,
}

#[derive(Debug, Deserialize)]
struct DeepLTranslation {
    text: String,
}
