//! Ranking of past corrections by how closely they relate to a sender.

use crate::models::CorrectionRecord;

/// Default number of corrections shown to the model
pub const DEFAULT_MAX_EXAMPLES: usize = 10;

/// Pick up to `max_examples` corrections for `sender`.
///
/// Corrections from the same sender come first, then those from the same
/// domain, then the rest. Order within each group is the input order, so a
/// newest-first input stays newest-first.
pub fn select_relevant_corrections<'a>(
    corrections: &'a [CorrectionRecord],
    sender: &str,
    max_examples: usize,
) -> Vec<&'a CorrectionRecord> {
    if corrections.is_empty() || sender.is_empty() {
        return Vec::new();
    }

    let sender_lower = sender.to_lowercase();
    let domain = extract_domain(&sender_lower);

    let mut same_sender = Vec::new();
    let mut same_domain = Vec::new();
    let mut general = Vec::new();

    for correction in corrections {
        let candidate = correction.sender.to_lowercase();
        if candidate == sender_lower {
            same_sender.push(correction);
        } else if !domain.is_empty() && extract_domain(&candidate) == domain {
            same_domain.push(correction);
        } else {
            general.push(correction);
        }
    }

    same_sender
        .into_iter()
        .chain(same_domain)
        .chain(general)
        .take(max_examples)
        .collect()
}

/// Domain part of `user@domain` or `Name <user@domain>`, empty when absent.
pub fn extract_domain(address: &str) -> &str {
    let address = match (address.find('<'), address.find('>')) {
        (Some(open), Some(_)) => {
            let inner = &address[open + 1..];
            inner.split('>').next().unwrap_or(inner)
        }
        _ => address,
    };

    match address.rfind('@') {
        Some(at) => address[at + 1..].trim(),
        None => "",
    }
}
