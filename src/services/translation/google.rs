// Google Cloud Translation (v2 REST)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::provider::{http_client, send_request, TranslationCall, TranslationProvider};
use crate::core::errors::{TranslationError, TranslationResult};
use crate::core::types::{TranslationProviderKind, AUTO_LANGUAGE};

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Debug, Deserialize)]
struct TranslateData {
    #[serde(default)]
    translations: Vec<TranslationItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslationItem {
    translated_text: String,
}

pub struct GoogleTranslator {
    http_client: reqwest::Client,
    endpoint: String,
}

impl GoogleTranslator {
    pub fn new(endpoint: &str, timeout: Duration) -> TranslationResult<Self> {
        Ok(Self {
            http_client: http_client(timeout)?,
            endpoint: endpoint.to_string(),
        })
    }

    fn build_request<'a>(call: &TranslationCall<'a>) -> TranslateRequest<'a> {
        TranslateRequest {
            q: call.text,
            target: call.target,
            source: (call.source != AUTO_LANGUAGE).then_some(call.source),
            format: "text",
        }
    }

    fn parse_response(data: TranslateResponse) -> TranslationResult<String> {
        data.data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| TranslationError::InvalidResponse("no translations returned".to_string()))
    }
}

#[async_trait]
impl TranslationProvider for GoogleTranslator {
    fn kind(&self) -> TranslationProviderKind {
        TranslationProviderKind::Google
    }

    #[instrument(skip(self, call), fields(source = call.source, target = call.target))]
    async fn translate(&self, call: TranslationCall<'_>) -> TranslationResult<String> {
        let request = Self::build_request(&call);
        let start = Instant::now();

        let response = send_request(
            "google",
            self.http_client
                .post(&self.endpoint)
                .query(&[("key", call.api_key)])
                .json(&request),
        )
        .await?;

        let data: TranslateResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
        let text = Self::parse_response(data)?;

        debug!(
            "google: translated {} chars in {:.2}ms",
            call.text.chars().count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_auto_source() {
        let call = TranslationCall {
            text: "こんにちは",
            source: "auto",
            target: "en",
            api_key: "k",
        };
        let value = serde_json::to_value(GoogleTranslator::build_request(&call)).unwrap();
        assert_eq!(value["q"], "こんにちは");
        assert_eq!(value["format"], "text");
        assert!(value.get("source").is_none());

        let call = TranslationCall { source: "ja", ..call };
        let value = serde_json::to_value(GoogleTranslator::build_request(&call)).unwrap();
        assert_eq!(value["source"], "ja");
    }

    #[test]
    fn test_parse_response() {
        let data: TranslateResponse = serde_json::from_str(
            r#"{"data":{"translations":[{"translatedText":"Hello","detectedSourceLanguage":"ja"}]}}"#,
        )
        .unwrap();
        assert_eq!(GoogleTranslator::parse_response(data).unwrap(), "Hello");

        let empty: TranslateResponse = serde_json::from_str(r#"{"data":{}}"#).unwrap();
        assert!(matches!(
            GoogleTranslator::parse_response(empty),
            Err(TranslationError::InvalidResponse(_))
        ));
    }
}
