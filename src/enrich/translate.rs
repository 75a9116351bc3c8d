use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{EnrichedValue, Enricher};
use crate::client::ChatBackend;
use crate::error::EnrichError;

pub const UNTRANSLATED: &str = "unable to translate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation(pub String);

impl EnrichedValue for Translation {
    fn columns() -> &'static [&'static str] {
        &["Name_translated"]
    }

    fn to_cells(&self) -> Vec<String> {
        vec![self.0.clone()]
    }
}

/// Translates product names to English.
pub struct TranslateEnricher {
    backend: Arc<dyn ChatBackend>,
}

impl TranslateEnricher {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        TranslateEnricher { backend }
    }
}

#[derive(Deserialize)]
struct TranslationReply {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

fn prompt(name: &str) -> String {
    format!(
        "Translate the product name \"{}\" to English and return it under the json key \"translatedText\".",
        name
    )
}

pub fn parse_response(raw: &str) -> Result<Translation, EnrichError> {
    let reply: TranslationReply = serde_json::from_str(raw)?;
    let text = reply.translated_text.trim();
    if text.is_empty() {
        return Err(EnrichError::Malformed("empty translatedText".into()));
    }
    Ok(Translation(text.to_string()))
}

#[async_trait]
impl Enricher for TranslateEnricher {
    type Output = Translation;

    fn name(&self) -> &'static str {
        "translation"
    }

    fn input_column(&self) -> &'static str {
        "Name"
    }

    fn fallback(&self) -> Translation {
        Translation(UNTRANSLATED.to_string())
    }

    /// Until translated, a row shows its original name.
    fn pending(&self, input: &str) -> Translation {
        Translation(input.to_string())
    }

    async fn enrich(&self, input: &str) -> Result<Translation, EnrichError> {
        if input.trim().is_empty() {
            return Err(EnrichError::Input("empty name".into()));
        }
        let raw = self.backend.complete_json(&prompt(input)).await?;
        parse_response(&raw)
    }
}
