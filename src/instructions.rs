//! Classification prompt rendering.

use crate::error::Result;
use crate::models::{ClassificationInput, CorrectionRecord};

const ROLE_SECTION: &str = "\
Role: You are an expert email classifier. Classify each email into exactly one of these categories:
  1. URGENT: Needs action from the reader soon, such as security alerts, overdue bills, deadlines or time-sensitive requests. Prefer URGENT over PERSONAL when a reply or action is needed within 24-48 hours.
  2. PERSONAL: Written by a person to the reader, such as friends, family, colleagues or one-to-one conversations. Prefer PERSONAL over INFORMATIONAL when a real person is addressing the reader directly.
  3. INFORMATIONAL: Useful but not actionable, such as receipts, shipping updates, account statements or newsletters the reader chose to receive. Prefer INFORMATIONAL over PROMOTIONAL when the main content is not selling anything.
  4. PROMOTIONAL: Marketing from a known brand, such as sales, coupons, offers or product announcements. Prefer PROMOTIONAL over NOISE when the sender is a legitimate business.
  5. NOISE: Spam, phishing, unsolicited bulk mail and anything with no value to the reader.
";

const CONFIDENCE_SECTION: &str = "\
CONFIDENCE SCORING GUIDELINES:
Your confidence score (1-5) indicates how certain you are about the classification:
  - 5: Extremely confident - clear, unambiguous evidence, no edge cases
  - 4: Very confident - strong evidence, minor ambiguity possible
  - 3: Moderately confident - some evidence, but ambiguity exists
  - 2: Low confidence - weak evidence, significant ambiguity
  - 1: Unsure - minimal evidence, high ambiguity

Respond with a single JSON object and nothing else:
{\"category\": \"<one of URGENT, PERSONAL, INFORMATIONAL, PROMOTIONAL, NOISE>\", \"reasoning\": \"<one sentence>\", \"confidence\": <1-5>, \"keywords_found\": [\"<keyword>\", ...]}
";

/// Render the prompt for one email.
///
/// The corrections section appears only when at least one correction is
/// given; `None` and an empty slice render the same text.
pub fn build_instruction(
    input: &ClassificationInput,
    corrections: Option<&[&CorrectionRecord]>,
) -> Result<String> {
    let email_json = serde_json::to_string(input)?;

    let mut prompt = String::with_capacity(
        ROLE_SECTION.len() + CONFIDENCE_SECTION.len() + email_json.len() + 512,
    );
    prompt.push_str(ROLE_SECTION);
    prompt.push('\n');

    if let Some(corrections) = corrections.filter(|c| !c.is_empty()) {
        prompt.push_str(&format_few_shot_examples(corrections));
        prompt.push('\n');
    }

    prompt.push_str("Task: Classify ONLY the email provided below.\n\n");
    prompt.push_str("--- EMAIL TO CLASSIFY ---\n");
    prompt.push_str(&email_json);
    prompt.push_str("\n-------------------------\n\n");
    prompt.push_str(CONFIDENCE_SECTION);

    Ok(prompt)
}

fn format_few_shot_examples(corrections: &[&CorrectionRecord]) -> String {
    let mut lines = vec![
        "EXAMPLES FROM PREVIOUS CORRECTIONS:".to_string(),
        "The following emails were misclassified earlier and then corrected by a human reviewer.".to_string(),
        "Use them as reference for your classification.".to_string(),
        String::new(),
    ];

    for (i, correction) in corrections.iter().enumerate() {
        lines.push(format!("Example {}:", i + 1));
        lines.push(format!("  Sender: {}", correction.sender));
        lines.push(format!("  Subject: {}", correction.subject));
        lines.push(format!(
            "  Incorrect classification: {}",
            correction.original_classification
        ));
        lines.push(format!(
            "  Correct classification: {}",
            correction.corrected_classification
        ));
        if let Some(note) = correction.note.as_deref().filter(|n| !n.is_empty()) {
            lines.push(format!("  Reviewer note: {}", note));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn input() -> ClassificationInput {
        ClassificationInput {
            sender: "billing@bank.com".to_string(),
            subject: "Your statement is ready".to_string(),
            body: Some("Statement for \"March\"\nTotal: $10".to_string()),
            snippet: None,
        }
    }

    fn correction(note: Option<&str>) -> CorrectionRecord {
        CorrectionRecord {
            sender: "alerts@bank.com".to_string(),
            subject: "Login from new device".to_string(),
            original_classification: "NOISE".to_string(),
            corrected_classification: "URGENT".to_string(),
            note: note.map(str::to_string),
            corrected_at: Utc::now(),
        }
    }

    #[test]
    fn test_none_and_empty_render_identically() {
        let without = build_instruction(&input(), None).unwrap();
        let empty = build_instruction(&input(), Some(&[][..])).unwrap();
        assert_eq!(without, empty);
        assert!(!without.contains("EXAMPLES FROM PREVIOUS CORRECTIONS"));
    }

    #[test]
    fn test_categories_and_rubric_present() {
        let prompt = build_instruction(&input(), None).unwrap();
        for category in ["URGENT", "PERSONAL", "INFORMATIONAL", "PROMOTIONAL", "NOISE"] {
            assert!(prompt.contains(category), "missing {}", category);
        }
        assert!(prompt.contains("5: Extremely confident"));
        assert!(prompt.contains("1: Unsure"));
    }

    #[test]
    fn test_email_embedded_as_json() {
        let prompt = build_instruction(&input(), None).unwrap();
        let expected = serde_json::to_string(&input()).unwrap();
        assert!(prompt.contains(&expected));
        assert!(prompt.contains(r#"\"March\""#));
    }

    #[test]
    fn test_examples_are_numbered() {
        let first = correction(Some("Security alerts are always urgent"));
        let mut second = correction(None);
        second.sender = "News Desk <digest@paper.com>".to_string();
        second.subject = "Morning briefing".to_string();
        let prompt = build_instruction(&input(), Some(&[&first, &second][..])).unwrap();

        assert!(prompt.contains("EXAMPLES FROM PREVIOUS CORRECTIONS:"));
        assert!(prompt.contains("Example 1:"));
        assert!(prompt.contains("Example 2:"));
        assert!(prompt.contains("  Sender: alerts@bank.com"));
        assert!(prompt.contains("  Subject: Login from new device"));
        assert!(prompt.contains("  Sender: News Desk <digest@paper.com>"));
        assert!(prompt.contains("  Subject: Morning briefing"));
        assert!(prompt.find("alerts@bank.com").unwrap() < prompt.find("digest@paper.com").unwrap());
        assert!(prompt.contains("Incorrect classification: NOISE"));
        assert!(prompt.contains("Correct classification: URGENT"));
        assert_eq!(prompt.matches("Reviewer note:").count(), 1);
        assert!(prompt.contains("Reviewer note: Security alerts are always urgent"));
    }

    #[test]
    fn test_empty_note_has_no_note_line() {
        let c = correction(Some(""));
        let prompt = build_instruction(&input(), Some(&[&c][..])).unwrap();
        assert!(prompt.contains("Example 1:"));
        assert!(!prompt.contains("Reviewer note"));
    }

    #[test]
    fn test_examples_precede_email() {
        let c = correction(None);
        let prompt = build_instruction(&input(), Some(&[&c][..])).unwrap();
        let examples_at = prompt.find("EXAMPLES FROM PREVIOUS CORRECTIONS").unwrap();
        let email_at = prompt.find("--- EMAIL TO CLASSIFY ---").unwrap();
        assert!(examples_at < email_at);
    }
}
