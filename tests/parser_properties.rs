//! Property tests: the response parser accepts anything and stays in bounds

use email_janitor::models::{EmailCategory, CONFIDENCE_MAX, CONFIDENCE_MIN};
use email_janitor::parser::parse_classification;
use proptest::prelude::*;

fn category() -> impl Strategy<Value = EmailCategory> {
    prop::sample::select(EmailCategory::ALL.to_vec())
}

proptest! {
    #[test]
    fn never_panics_and_confidence_in_range(raw in ".*") {
        let output = parse_classification(&raw);
        prop_assert!(output.confidence >= CONFIDENCE_MIN);
        prop_assert!(output.confidence <= CONFIDENCE_MAX);
    }

    #[test]
    fn fenced_noise_never_panics(prefix in "[a-z ]{0,10}", inner in ".{0,80}") {
        let raw = format!("```{}\n{{{}}}\n```", prefix, inner);
        let output = parse_classification(&raw);
        prop_assert!(output.confidence >= CONFIDENCE_MIN);
        prop_assert!(output.confidence <= CONFIDENCE_MAX);
    }

    #[test]
    fn valid_replies_survive_chatter(
        category in category(),
        confidence in 1u8..=5,
        before in "[A-Za-z .,]{0,40}",
        after in "[A-Za-z .,]{0,40}",
        fence in any::<bool>(),
    ) {
        let json = format!(
            r#"{{"category": "{}", "reasoning": "ok", "confidence": {}}}"#,
            category, confidence
        );
        let raw = if fence {
            format!("```json\n{}\n```", json)
        } else {
            format!("{} {} {}", before, json, after)
        };

        let output = parse_classification(&raw);
        prop_assert_eq!(output.category, category);
        prop_assert_eq!(output.confidence, f64::from(confidence));
        prop_assert_eq!(output.reasoning, "ok");
    }

    #[test]
    fn out_of_range_confidence_falls_back(confidence in prop_oneof![-100.0f64..0.99, 5.01f64..100.0]) {
        let raw = format!(
            r#"{{"category": "URGENT", "reasoning": "x", "confidence": {}}}"#,
            confidence
        );
        let output = parse_classification(&raw);
        prop_assert_eq!(output.category, EmailCategory::Noise);
        prop_assert_eq!(output.confidence, 1.0);
        prop_assert!(output.reasoning.starts_with("Parsing error"));
    }
}
