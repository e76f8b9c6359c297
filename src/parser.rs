//! Tolerant decoding of model output into a [`ClassificationOutput`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::models::{ClassificationOutput, EmailCategory, CONFIDENCE_DEFAULT};

static LEADING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_-]*\s*").expect("valid leading fence regex"));
static TRAILING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*```$").expect("valid trailing fence regex"));
static JSON_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid json object regex"));

#[derive(Debug, Deserialize)]
struct RawOutput {
    category: EmailCategory,
    reasoning: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    keywords_found: Vec<String>,
}

fn default_confidence() -> f64 {
    CONFIDENCE_DEFAULT
}

/// Strip markdown fences and isolate the outermost `{...}` span.
pub fn extract_json_candidate(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unfenced = if trimmed.starts_with("```") || trimmed.ends_with("```") {
        let start = LEADING_FENCE.find(trimmed).map_or(0, |m| m.end());
        let rest = &trimmed[start..];
        let end = TRAILING_FENCE.find(rest).map_or(rest.len(), |m| m.start());
        &rest[..end]
    } else {
        trimmed
    };

    JSON_OBJECT
        .find(unfenced)
        .map(|m| m.as_str())
        .unwrap_or_else(|| unfenced.trim())
}

/// Decode a model response. Never fails: unusable output becomes a
/// low-confidence NOISE verdict whose reasoning says what went wrong.
pub fn parse_classification(raw: &str) -> ClassificationOutput {
    if raw.trim().is_empty() {
        warn!("Model returned an empty response");
        return ClassificationOutput::fallback(
            "Parsing error: unable to parse model response: response was empty",
        );
    }

    match decode(extract_json_candidate(raw)) {
        Ok(output) => output,
        Err(reason) => {
            warn!(reason = %reason, "Falling back to NOISE for unparseable model response");
            ClassificationOutput::fallback(format!(
                "Parsing error: unable to parse model response: {}",
                reason
            ))
        }
    }
}

fn decode(candidate: &str) -> std::result::Result<ClassificationOutput, String> {
    let raw: RawOutput = serde_json::from_str(candidate).map_err(|e| e.to_string())?;

    if !ClassificationOutput::is_confidence_valid(raw.confidence) {
        return Err(format!("confidence {} is outside 1-5", raw.confidence));
    }

    Ok(ClassificationOutput {
        category: raw.category,
        reasoning: raw.reasoning,
        confidence: raw.confidence,
        keywords_found: raw.keywords_found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CONFIDENCE_UNSURE;

    fn assert_fallback(output: &ClassificationOutput) {
        assert_eq!(output.category, EmailCategory::Noise);
        assert_eq!(output.confidence, CONFIDENCE_UNSURE);
        let reasoning = output.reasoning.to_lowercase();
        assert!(reasoning.contains("error"));
        assert!(reasoning.contains("unable to parse"));
    }

    #[test]
    fn test_plain_json() {
        let output = parse_classification(
            r#"{"category": "URGENT", "reasoning": "Bill due tomorrow", "confidence": 4.5, "keywords_found": ["due"]}"#,
        );
        assert_eq!(output.category, EmailCategory::Urgent);
        assert_eq!(output.confidence, 4.5);
        assert_eq!(output.keywords_found, vec!["due"]);
    }

    #[test]
    fn test_fenced_json_with_annotation() {
        let raw = "```json\n{\"category\": \"PROMOTIONAL\", \"reasoning\": \"Sale\", \"confidence\": 5}\n```";
        let output = parse_classification(raw);
        assert_eq!(output.category, EmailCategory::Promotional);
        assert_eq!(output.confidence, 5.0);
    }

    #[test]
    fn test_bare_fence() {
        let raw = "```\n{\"category\": \"PERSONAL\", \"reasoning\": \"From mom\", \"confidence\": 4}\n```";
        assert_eq!(parse_classification(raw).category, EmailCategory::Personal);
    }

    #[test]
    fn test_surrounding_prose() {
        let raw = "Sure! Here is the answer:\n{\"category\": \"INFORMATIONAL\", \"reasoning\": \"Receipt\"}\nHope that helps.";
        let output = parse_classification(raw);
        assert_eq!(output.category, EmailCategory::Informational);
        assert_eq!(output.confidence, CONFIDENCE_DEFAULT);
        assert!(output.keywords_found.is_empty());
    }

    #[test]
    fn test_not_json() {
        assert_fallback(&parse_classification("not json at all"));
    }

    #[test]
    fn test_empty_response() {
        assert_fallback(&parse_classification(""));
        assert_fallback(&parse_classification("   \n"));
    }

    #[test]
    fn test_unknown_category() {
        assert_fallback(&parse_classification(
            r#"{"category": "SPAM", "reasoning": "x", "confidence": 3}"#,
        ));
        assert_fallback(&parse_classification(
            r#"{"category": "urgent", "reasoning": "x", "confidence": 3}"#,
        ));
    }

    #[test]
    fn test_confidence_out_of_range() {
        assert_fallback(&parse_classification(
            r#"{"category": "NOISE", "reasoning": "x", "confidence": 7}"#,
        ));
        assert_fallback(&parse_classification(
            r#"{"category": "NOISE", "reasoning": "x", "confidence": 0}"#,
        ));
    }

    #[test]
    fn test_missing_reasoning() {
        assert_fallback(&parse_classification(r#"{"category": "NOISE", "confidence": 2}"#));
    }

    #[test]
    fn test_extract_candidate_falls_back_to_trimmed_text() {
        assert_eq!(extract_json_candidate("  nothing here  "), "nothing here");
        assert_eq!(extract_json_candidate("```json\n[1, 2]\n```"), "[1, 2]");
    }
}
