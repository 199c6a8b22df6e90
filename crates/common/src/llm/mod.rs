//! Structured extraction client
//!
//! Turns one page of text plus a multi-page context window into a
//! `ResourceBundle` via an OpenAI-compatible chat completion constrained to
//! the bundle schema. The extractor is instructed to use only facts present
//! on the current page, to put an ICD-10 code on every diagnosis, and to
//! never invent information.

use crate::bundle::{is_valid_icd10, ResourceBundle};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

/// Trait for structured extraction providers
#[async_trait]
pub trait BundleExtractor: Send + Sync {
    /// Extract a per-page bundle from page text, given its context window
    async fn extract(&self, page_text: &str, context: &str) -> Result<ResourceBundle>;

    fn model_name(&self) -> &str;
}

const SYSTEM_PROMPT: &str = "\
You are a medical records extraction engine for legal-medical case files. \
You are given the text of one document page, plus excerpts of related pages \
for context only. Extract structured resources into the provided JSON schema.

Rules:
- Extract only facts explicitly present on the CURRENT PAGE. The context \
excerpts exist to resolve references (names, dates, providers), never as a \
source of new resources.
- Assign an ICD-10 code to every diagnosis. Use the code printed in the text \
when present; otherwise assign the best-matching code from your own coding \
knowledge.
- Give every resource a short stable id, unique within this page.
- Never invent patients, diagnoses, encounters, reports or claims. When the \
page contains nothing for a collection, return it empty.";

/// OpenAI-compatible chat-completion extractor
pub struct OpenAiExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: serde_json::Value,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiExtractor {
    pub fn new(config: &crate::config::ExtractionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "extraction.api_key is required".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    fn user_prompt(page_text: &str, context: &str) -> String {
        format!(
            "RELATED PAGES (context only):\n{}\n\nCURRENT PAGE:\n{}",
            context, page_text
        )
    }
}

#[async_trait]
impl BundleExtractor for OpenAiExtractor {
    async fn extract(&self, page_text: &str, context: &str) -> Result<ResourceBundle> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::user_prompt(page_text, context),
                },
            ],
            response_format: bundle_response_format(),
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Extraction {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Extraction {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: ChatResponse = response.json().await.map_err(|e| AppError::Extraction {
            message: format!("Failed to parse response envelope: {}", e),
        })?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Extraction {
                message: "Completion returned no content".to_string(),
            })?;

        parse_bundle_json(&content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// JSON schema the completion is constrained to.
///
/// Mirrors `ResourceBundle`; collections are required so an empty page comes
/// back as five empty arrays instead of missing fields.
fn bundle_response_format() -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "resource_bundle",
            "strict": false,
            "schema": {
                "type": "object",
                "properties": {
                    "patients": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "family_name": {"type": ["string", "null"]},
                                "given_name": {"type": ["string", "null"]},
                                "birth_date": {"type": ["string", "null"]},
                                "gender": {"type": ["string", "null"]}
                            },
                            "required": ["id"]
                        }
                    },
                    "conditions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "patient_id": {"type": ["string", "null"]},
                                "code": {"type": "string"},
                                "description": {"type": ["string", "null"]},
                                "onset_date": {"type": ["string", "null"]}
                            },
                            "required": ["id", "code"]
                        }
                    },
                    "encounters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "patient_id": {"type": ["string", "null"]},
                                "class": {"type": ["string", "null"]},
                                "period_start": {"type": ["string", "null"]},
                                "period_end": {"type": ["string", "null"]},
                                "provider": {"type": ["string", "null"]}
                            },
                            "required": ["id"]
                        }
                    },
                    "diagnostic_reports": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "patient_id": {"type": ["string", "null"]},
                                "code": {"type": ["string", "null"]},
                                "effective_date_time": {"type": ["string", "null"]},
                                "conclusion": {"type": ["string", "null"]}
                            },
                            "required": ["id"]
                        }
                    },
                    "claims": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "patient_id": {"type": ["string", "null"]},
                                "provider": {"type": ["string", "null"]},
                                "total_amount": {"type": ["number", "null"]},
                                "line_items": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "service_code": {"type": ["string", "null"]},
                                            "description": {"type": ["string", "null"]},
                                            "amount": {"type": ["number", "null"]},
                                            "service_date": {"type": ["string", "null"]}
                                        }
                                    }
                                }
                            },
                            "required": ["id"]
                        }
                    }
                },
                "required": ["patients", "conditions", "encounters", "diagnostic_reports", "claims"]
            }
        }
    })
}

/// Parse completion content into a validated bundle.
///
/// Tolerates markdown fences around the JSON. A condition without a
/// diagnosis code fails validation: the extractor was instructed to always
/// code diagnoses, so an uncoded one means the output cannot be trusted for
/// code-keyed merging.
pub fn parse_bundle_json(content: &str) -> Result<ResourceBundle> {
    let stripped = strip_code_fences(content);

    let bundle: ResourceBundle =
        serde_json::from_str(stripped).map_err(|e| AppError::SchemaValidation {
            message: format!("Bundle JSON did not match schema: {}", e),
        })?;

    for condition in &bundle.conditions {
        match condition.code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                if !is_valid_icd10(code) {
                    warn!(condition_id = %condition.id, code, "Condition code is not syntactically ICD-10");
                }
            }
            _ => {
                return Err(AppError::SchemaValidation {
                    message: format!("Condition {} has no diagnosis code", condition.id),
                });
            }
        }
    }

    Ok(bundle)
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bundle() {
        let content = r#"{
            "patients": [{"id": "p1", "family_name": "Diaz", "birth_date": "1960-01-31"}],
            "conditions": [{"id": "c1", "code": "I10", "description": "Essential hypertension"}],
            "encounters": [],
            "diagnostic_reports": [],
            "claims": []
        }"#;
        let bundle = parse_bundle_json(content).unwrap();
        assert_eq!(bundle.patients.len(), 1);
        assert_eq!(bundle.conditions[0].code.as_deref(), Some("I10"));
    }

    #[test]
    fn test_parse_fenced_bundle() {
        let content = "```json\n{\"patients\": [], \"conditions\": [], \"encounters\": [], \"diagnostic_reports\": [], \"claims\": []}\n```";
        let bundle = parse_bundle_json(content).unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_uncoded_condition_fails_validation() {
        let content = r#"{
            "patients": [],
            "conditions": [{"id": "c1", "description": "back pain"}],
            "encounters": [],
            "diagnostic_reports": [],
            "claims": []
        }"#;
        let err = parse_bundle_json(content).unwrap_err();
        assert!(matches!(err, AppError::SchemaValidation { .. }));
    }

    #[test]
    fn test_malformed_json_is_schema_error() {
        let err = parse_bundle_json("not json at all").unwrap_err();
        assert!(matches!(err, AppError::SchemaValidation { .. }));
    }

    #[test]
    fn test_extractor_requires_api_key() {
        let config = crate::config::ExtractionConfig::default();
        assert!(OpenAiExtractor::new(&config).is_err());
    }
}
