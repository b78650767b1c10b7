use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Messaging backends in dispatch priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    Templated,
    Transactional,
    Vendor,
    Sandbox,
}

impl BackendId {
    pub const PRIORITY: [BackendId; 4] = [
        BackendId::Templated,
        BackendId::Transactional,
        BackendId::Vendor,
        BackendId::Sandbox,
    ];

    /// Position in [`BackendId::PRIORITY`]; lower goes first.
    pub fn rank(&self) -> usize {
        match self {
            BackendId::Templated => 0,
            BackendId::Transactional => 1,
            BackendId::Vendor => 2,
            BackendId::Sandbox => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Templated => "templated",
            BackendId::Transactional => "transactional",
            BackendId::Vendor => "vendor",
            BackendId::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub name: String,
}

/// One identification suggestion event, fully resolved by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    pub collection_name: String,
    pub collection_date: String,
    pub suggester_name: String,
    pub suggester_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_genus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_common_name: Option<String>,
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
}

impl NotificationPayload {
    pub fn confidence_level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.confidence)
    }
}

/// Display bucket for the 1-5 confidence score. Anything outside the range
/// (or absent) is `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    Unspecified,
}

impl ConfidenceLevel {
    pub fn from_score(score: Option<i64>) -> Self {
        match score {
            Some(1) => ConfidenceLevel::VeryLow,
            Some(2) => ConfidenceLevel::Low,
            Some(3) => ConfidenceLevel::Medium,
            Some(4) => ConfidenceLevel::High,
            Some(5) => ConfidenceLevel::VeryHigh,
            _ => ConfidenceLevel::Unspecified,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceLevel::VeryLow => "Muito Baixa",
            ConfidenceLevel::Low => "Baixa",
            ConfidenceLevel::Medium => "Média",
            ConfidenceLevel::High => "Alta",
            ConfidenceLevel::VeryHigh => "Muito Alta",
            ConfidenceLevel::Unspecified => "Não informada",
        }
    }

    /// Badge colour used by the HTML body.
    pub fn color(&self) -> &'static str {
        match self {
            ConfidenceLevel::VeryLow => "#f44336",
            ConfidenceLevel::Low => "#ff9800",
            ConfidenceLevel::Medium => "#ffc107",
            ConfidenceLevel::High => "#4caf50",
            ConfidenceLevel::VeryHigh => "#2e7d32",
            ConfidenceLevel::Unspecified => "#9e9e9e",
        }
    }
}

/// A notification that could not be delivered (or was simulated), persisted
/// in the local outbox. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub recipient_address: String,
    pub recipient_name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub payload: NotificationPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RetryableFailure => "retryable_failure",
            AttemptOutcome::FatalFailure => "fatal_failure",
        }
    }
}

/// One call into a backend during a dispatch. Kept in memory for logging
/// and reports; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub backend: BackendId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_matches_priority_order() {
        for (i, id) in BackendId::PRIORITY.iter().enumerate() {
            assert_eq!(id.rank(), i);
        }
    }

    #[test]
    fn confidence_labels_and_colors() {
        let expected = [
            (1, "Muito Baixa", "#f44336"),
            (2, "Baixa", "#ff9800"),
            (3, "Média", "#ffc107"),
            (4, "Alta", "#4caf50"),
            (5, "Muito Alta", "#2e7d32"),
        ];
        for (score, label, color) in expected {
            let level = ConfidenceLevel::from_score(Some(score));
            assert_eq!(level.label(), label);
            assert_eq!(level.color(), color);
        }
    }

    #[test]
    fn out_of_range_confidence_is_unspecified() {
        for score in [Some(0), Some(6), Some(-3), Some(i64::MAX), None] {
            let level = ConfidenceLevel::from_score(score);
            assert_eq!(level, ConfidenceLevel::Unspecified);
            assert_eq!(level.label(), "Não informada");
            assert_eq!(level.color(), "#9e9e9e");
        }
    }

    #[test]
    fn payload_omits_absent_optionals_when_serialized() {
        let payload = NotificationPayload {
            collection_name: "Ipê".into(),
            collection_date: "2024-03-01".into(),
            suggester_name: "Ana".into(),
            suggester_address: "ana@example.org".into(),
            justification: "flores amarelas".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("suggested_family").is_none());
        assert!(value.get("confidence").is_none());
        let back: NotificationPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn backend_priority_order() {
        let names: Vec<_> = BackendId::PRIORITY.iter().map(|b| b.as_str()).collect();
        assert_eq!(names, vec!["templated", "transactional", "vendor", "sandbox"]);
    }
}
