// src/priority.rs
use serde::{Deserialize, Serialize};

/// Delivery urgency derived from the recall itself. Urgent alerts are
/// rendered for immediate delivery; digest alerts may be batched by the
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Digest,
}

const URGENT_HAZARDS: [&str; 4] = ["fire", "burn", "choking", "death"];

/// Class I enforcement reports and life-safety hazards are urgent,
/// everything else goes to the digest.
pub fn classify(classification: Option<&str>, hazard: Option<&str>) -> Priority {
    if classification
        .map(|c| c.trim().eq_ignore_ascii_case("class i"))
        .unwrap_or(false)
    {
        return Priority::Urgent;
    }
    let hazard = hazard.unwrap_or_default().to_ascii_lowercase();
    if URGENT_HAZARDS.iter().any(|w| hazard.contains(w)) {
        return Priority::Urgent;
    }
    Priority::Digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_i_is_urgent() {
        assert_eq!(classify(Some("Class I"), None), Priority::Urgent);
        assert_eq!(classify(Some("class i"), Some("minor")), Priority::Urgent);
    }

    #[test]
    fn hazard_keywords_are_urgent() {
        assert_eq!(classify(None, Some("Fire and burn hazard")), Priority::Urgent);
        assert_eq!(classify(None, Some("Choking risk for toddlers")), Priority::Urgent);
    }

    #[test]
    fn everything_else_is_digest() {
        assert_eq!(classify(None, Some("Label misprint")), Priority::Digest);
        assert_eq!(classify(Some("Class II"), None), Priority::Digest);
        assert_eq!(classify(None, None), Priority::Digest);
    }
}
