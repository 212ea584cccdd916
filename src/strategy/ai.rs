use serde::{Deserialize, Serialize};

use super::{AttemptOutcome, Learning, StrategyContext};
use crate::error::{FerretError, Result};
use crate::models::{ExtractedTransaction, FileType, ParsingMethod, TransactionType};
use crate::normalize::{normalize_date, round_cents};
use crate::settings::Settings;
use crate::validation::session_confidence;

/// What the extractor is shown: the document's text when there is any,
/// otherwise its raw bytes.
#[derive(Debug, Clone, Copy)]
pub enum AiInput<'a> {
    Text(&'a str),
    Document { file_type: FileType, bytes: &'a [u8] },
}

/// One transaction as reported by the model. Amounts may be signed when
/// `type` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiTransaction {
    pub date: String,
    pub amount: f64,
    pub description: String,
    #[serde(rename = "type", default)]
    pub txn_type: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiExtraction {
    pub transactions: Vec<AiTransaction>,
    pub confidence: f64,
}

/// External model that turns a document into transactions.
pub trait AiExtractor {
    fn extract(&self, input: AiInput<'_>) -> Result<AiExtraction>;
}

/// Used when no endpoint is configured.
pub struct UnavailableExtractor;

impl AiExtractor for UnavailableExtractor {
    fn extract(&self, _input: AiInput<'_>) -> Result<AiExtraction> {
        Err(FerretError::StrategyUnavailable(
            "no AI endpoint configured".to_string(),
        ))
    }
}

#[cfg(feature = "ai")]
pub use http::HttpAiExtractor;

#[cfg(feature = "ai")]
mod http {
    use std::time::Duration;

    use base64::Engine;
    use serde::Serialize;

    use super::{AiExtraction, AiExtractor, AiInput};
    use crate::error::{FerretError, Result};

    /// Posts the document as JSON to an extraction endpoint.
    pub struct HttpAiExtractor {
        endpoint: String,
        api_key: Option<String>,
        client: reqwest::blocking::Client,
        timeout_secs: u64,
    }

    #[derive(Serialize)]
    struct ExtractRequest<'a> {
        file_type: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_base64: Option<String>,
    }

    impl HttpAiExtractor {
        pub fn new(endpoint: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?;
            Ok(Self {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key,
                client,
                timeout_secs,
            })
        }

        fn unavailable(&self, e: reqwest::Error) -> FerretError {
            if e.is_timeout() {
                FerretError::StrategyUnavailable(format!(
                    "AI request timed out after {}s",
                    self.timeout_secs
                ))
            } else if e.is_connect() {
                FerretError::StrategyUnavailable(format!("cannot reach {}", self.endpoint))
            } else {
                FerretError::Http(e)
            }
        }
    }

    impl AiExtractor for HttpAiExtractor {
        fn extract(&self, input: AiInput<'_>) -> Result<AiExtraction> {
            let body = match input {
                AiInput::Text(text) => ExtractRequest {
                    file_type: "text",
                    text: Some(text),
                    content_base64: None,
                },
                AiInput::Document { file_type, bytes } => ExtractRequest {
                    file_type: file_type.key(),
                    text: None,
                    content_base64: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                },
            };

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().map_err(|e| self.unavailable(e))?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(FerretError::StrategyUnavailable(format!(
                    "AI endpoint returned {status}"
                )));
            }
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(FerretError::Other(format!("AI endpoint returned {status}: {body}")));
            }
            let extraction: AiExtraction = response.json().map_err(|e| self.unavailable(e))?;
            Ok(extraction)
        }
    }
}

/// Build the configured extractor, falling back to [`UnavailableExtractor`].
pub fn from_settings(settings: &Settings) -> Box<dyn AiExtractor> {
    match settings.ai_endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        Some(endpoint) => http_extractor(endpoint, settings),
        None => Box::new(UnavailableExtractor),
    }
}

#[cfg(feature = "ai")]
fn http_extractor(endpoint: &str, settings: &Settings) -> Box<dyn AiExtractor> {
    let api_key = std::env::var(&settings.ai_api_key_env).ok();
    match HttpAiExtractor::new(endpoint, api_key, settings.ai_timeout_secs) {
        Ok(extractor) => Box::new(extractor),
        Err(e) => {
            tracing::warn!(error = %e, "AI client setup failed");
            Box::new(UnavailableExtractor)
        }
    }
}

#[cfg(not(feature = "ai"))]
fn http_extractor(_endpoint: &str, _settings: &Settings) -> Box<dyn AiExtractor> {
    tracing::warn!("ai_endpoint is set but ferret was built without the `ai` feature");
    Box::new(UnavailableExtractor)
}

/// Normalize a model-reported transaction. The model's own confidence is
/// capped by the extraction-level score.
fn to_transaction(t: AiTransaction, overall: f64, pivot: u32) -> ExtractedTransaction {
    let confidence = t.confidence.unwrap_or(overall).min(overall).clamp(0.0, 1.0);
    let date = normalize_date(&t.date, pivot).unwrap_or(t.date);
    let declared = t.txn_type.as_deref().and_then(|k| k.parse::<TransactionType>().ok());
    let mut txn = ExtractedTransaction::from_signed(
        date,
        round_cents(t.amount),
        t.description.trim().to_string(),
        confidence,
        ParsingMethod::AiFallback,
    );
    if let Some(kind) = declared {
        txn.txn_type = kind;
    }
    txn.balance = t.balance;
    txn.category = t.category;
    txn.merchant = t.merchant;
    txn
}

pub fn attempt(ctx: &StrategyContext<'_>) -> AttemptOutcome {
    let text = ctx.document.text();
    let input = if text.trim().is_empty() {
        AiInput::Document {
            file_type: ctx.document.file_type,
            bytes: &ctx.document.bytes,
        }
    } else {
        AiInput::Text(&text)
    };
    let extraction = match ctx.ai.extract(input) {
        Ok(e) => e,
        Err(e) => return AttemptOutcome::Failed(e),
    };
    if extraction.transactions.is_empty() {
        return AttemptOutcome::Failed(FerretError::NoMatchFound);
    }
    let overall = extraction.confidence;
    let transactions: Vec<ExtractedTransaction> = extraction
        .transactions
        .into_iter()
        .map(|t| to_transaction(t, overall, ctx.settings.date_pivot_year))
        .collect();
    AttemptOutcome::Extracted {
        confidence: session_confidence(&transactions),
        detail: Some(format!("model reported confidence {overall:.2}")),
        transactions,
        learning: Learning::None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::document::Document;

    /// Returns a canned extraction and remembers whether it saw text.
    pub(crate) struct FakeExtractor {
        pub result: std::result::Result<AiExtraction, &'static str>,
        pub saw_text: std::cell::Cell<Option<bool>>,
    }

    impl FakeExtractor {
        pub(crate) fn returning(transactions: Vec<AiTransaction>, confidence: f64) -> Self {
            Self {
                result: Ok(AiExtraction { transactions, confidence }),
                saw_text: std::cell::Cell::new(None),
            }
        }

        pub(crate) fn unavailable() -> Self {
            Self {
                result: Err("rate limited"),
                saw_text: std::cell::Cell::new(None),
            }
        }
    }

    impl AiExtractor for FakeExtractor {
        fn extract(&self, input: AiInput<'_>) -> Result<AiExtraction> {
            self.saw_text.set(Some(matches!(input, AiInput::Text(_))));
            match &self.result {
                Ok(e) => Ok(e.clone()),
                Err(msg) => Err(FerretError::StrategyUnavailable(msg.to_string())),
            }
        }
    }

    pub(crate) fn ai_txn(date: &str, amount: f64, description: &str, kind: Option<&str>) -> AiTransaction {
        AiTransaction {
            date: date.to_string(),
            amount,
            description: description.to_string(),
            txn_type: kind.map(str::to_string),
            balance: None,
            category: None,
            merchant: None,
            confidence: None,
        }
    }

    fn run(doc: &Document, ai: &dyn AiExtractor) -> AttemptOutcome {
        let (_dir, conn) = test_db();
        let settings = Settings::default();
        attempt(&StrategyContext {
            conn: &conn,
            document: doc,
            settings: &settings,
            ai,
        })
    }

    #[test]
    fn test_unavailable_when_unconfigured() {
        let doc = Document::from_text(FileType::Text, "01/01/2024 COFFEE 4.50");
        match run(&doc, &UnavailableExtractor) {
            AttemptOutcome::Failed(FerretError::StrategyUnavailable(_)) => {}
            other => panic!("expected StrategyUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_extraction_is_normalized() {
        let doc = Document::from_text(FileType::Text, "statement text");
        let fake = FakeExtractor::returning(
            vec![
                ai_txn("01/15/2024", -2000.0, "Salary", None),
                ai_txn("2024-01-16", 4.5, " Coffee ", Some("expense")),
            ],
            0.8,
        );
        let AttemptOutcome::Extracted { transactions, confidence, .. } = run(&doc, &fake) else {
            panic!("expected an extraction");
        };
        assert_eq!(fake.saw_text.get(), Some(true));
        assert_eq!(transactions[0].date, "2024-01-15");
        assert_eq!(transactions[0].amount, 2000.0);
        assert_eq!(transactions[0].txn_type, TransactionType::Credit);
        assert_eq!(transactions[1].description, "Coffee");
        assert_eq!(transactions[1].txn_type, TransactionType::Debit);
        assert!(transactions.iter().all(|t| t.source == ParsingMethod::AiFallback));
        assert!((confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_binary_documents_are_sent_as_bytes() {
        let doc = Document {
            file_type: FileType::Pdf,
            table: None,
            lines: Vec::new(),
            bytes: b"%PDF-1.7".to_vec(),
        };
        let fake = FakeExtractor::returning(vec![ai_txn("2024-01-01", 1.0, "Fee", None)], 0.4);
        let AttemptOutcome::Extracted { confidence, .. } = run(&doc, &fake) else {
            panic!("expected an extraction");
        };
        assert_eq!(fake.saw_text.get(), Some(false));
        assert!(confidence < 0.6);
    }

    #[test]
    fn test_model_confidence_is_capped() {
        let mut t = ai_txn("2024-01-01", 1.0, "Fee", None);
        t.confidence = Some(0.99);
        assert_eq!(to_transaction(t, 0.7, 50).confidence, 0.7);
    }

    #[test]
    fn test_empty_extraction_fails() {
        let doc = Document::from_text(FileType::Text, "nothing");
        let fake = FakeExtractor::returning(Vec::new(), 0.9);
        assert!(matches!(run(&doc, &fake), AttemptOutcome::Failed(FerretError::NoMatchFound)));
    }

    #[test]
    fn test_from_settings_without_endpoint() {
        let ai = from_settings(&Settings::default());
        let err = ai.extract(AiInput::Text("x")).unwrap_err();
        assert!(matches!(err, FerretError::StrategyUnavailable(_)));
    }
}
