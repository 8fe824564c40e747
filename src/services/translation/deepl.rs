// DeepL (v2 REST)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::provider::{http_client, send_request, TranslationCall, TranslationProvider};
use crate::core::errors::{TranslationError, TranslationResult};
use crate::core::types::{TranslationProviderKind, AUTO_LANGUAGE};

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: Vec<&'a str>,
    target_lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(default)]
    translations: Vec<TranslationItem>,
}

#[derive(Debug, Deserialize)]
struct TranslationItem {
    text: String,
}

/// DeepL wants upper-case codes; source languages carry no region
fn deepl_code(code: &str, keep_region: bool) -> String {
    let code = code.trim();
    let code = if keep_region {
        code
    } else {
        code.split(['-', '_']).next().unwrap_or(code)
    };
    code.replace('_', "-").to_uppercase()
}

pub struct DeepLTranslator {
    http_client: reqwest::Client,
    endpoint: String,
}

impl DeepLTranslator {
    pub fn new(endpoint: &str, timeout: Duration) -> TranslationResult<Self> {
        Ok(Self {
            http_client: http_client(timeout)?,
            endpoint: endpoint.to_string(),
        })
    }

    fn build_request<'a>(call: &TranslationCall<'a>) -> TranslateRequest<'a> {
        TranslateRequest {
            text: vec![call.text],
            target_lang: deepl_code(call.target, true),
            source_lang: (call.source != AUTO_LANGUAGE).then(|| deepl_code(call.source, false)),
        }
    }
}

#[async_trait]
impl TranslationProvider for DeepLTranslator {
    fn kind(&self) -> TranslationProviderKind {
        TranslationProviderKind::DeepL
    }

    #[instrument(skip(self, call), fields(source = call.source, target = call.target))]
    async fn translate(&self, call: TranslationCall<'_>) -> TranslationResult<String> {
        let request = Self::build_request(&call);
        let start = Instant::now();

        let response = send_request(
            "deepl",
            self.http_client
                .post(&self.endpoint)
                .header("Authorization", format!("DeepL-Auth-Key {}", call.api_key))
                .json(&request),
        )
        .await?;

        let data: TranslateResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
        let text = data
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| TranslationError::InvalidResponse("no translations returned".to_string()))?;

        debug!(
            "deepl: translated {} chars in {:.2}ms",
            call.text.chars().count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(text)
    }
}
