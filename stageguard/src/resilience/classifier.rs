//! Failure classification.
//!
//! Labels a collaborator failure TRANSIENT or PERMANENT from an ordered rule
//! table. The first matching rule wins; a failure no rule matches is treated
//! as TRANSIENT so that unknown errors still get their retry budget.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::errors::StageFailure;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Do not retry.
    Permanent,
}

/// The sub-kind recorded alongside a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call exceeded its deadline.
    Timeout,
    /// The service throttled the caller.
    RateLimit,
    /// The connection failed.
    Connection,
    /// The service reported a 5xx-style error.
    ServerError,
    /// Credentials were rejected.
    Authentication,
    /// The request was malformed or failed validation.
    InvalidRequest,
    /// The requested resource does not exist.
    NotFound,
    /// No rule matched.
    Unclassified,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Connection => write!(f, "connection"),
            Self::ServerError => write!(f, "server_error"),
            Self::Authentication => write!(f, "authentication"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::NotFound => write!(f, "not_found"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// The result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Transient or permanent.
    pub class: FailureClass,
    /// The recorded sub-kind.
    pub kind: FailureKind,
}

impl Classification {
    /// Classification used for attempts that exceeded the stage timeout.
    #[must_use]
    pub const fn timeout() -> Self {
        Self {
            class: FailureClass::Transient,
            kind: FailureKind::Timeout,
        }
    }

    /// Returns true if the failure should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

/// One entry of the rule table.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pattern: Regex,
    classification: Classification,
}

impl ClassificationRule {
    /// Compiles a rule. Patterns are matched case-insensitively.
    pub fn new(pattern: &str, class: FailureClass, kind: FailureKind) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("(?i){pattern}"))?,
            classification: Classification { class, kind },
        })
    }

    /// Returns the classification if the rule matches.
    #[must_use]
    pub fn matches(&self, text: &str) -> Option<Classification> {
        self.pattern.is_match(text).then_some(self.classification)
    }
}

const STANDARD_RULES: &[(&str, FailureClass, FailureKind)] = &[
    (
        r"\btime[ds]?[\s_-]?outs?\b|deadline exceeded",
        FailureClass::Transient,
        FailureKind::Timeout,
    ),
    (
        r"rate[\s_-]?limit|too many requests|\b429\b|throttl|overloaded",
        FailureClass::Transient,
        FailureKind::RateLimit,
    ),
    (
        r"connection (?:reset|refused|closed|aborted|error)|broken pipe|network (?:error|unreachable)|dns (?:error|failure)|econn(?:reset|refused)|temporarily unavailable",
        FailureClass::Transient,
        FailureKind::Connection,
    ),
    (
        r"\b5\d{2}\b|internal server error|bad gateway|service unavailable",
        FailureClass::Transient,
        FailureKind::ServerError,
    ),
    (
        r"unauthori[sz]ed|authentication|forbidden|invalid api key|permission denied|\b40[13]\b",
        FailureClass::Permanent,
        FailureKind::Authentication,
    ),
    (
        r"invalid request|bad request|validation (?:error|failed)|malformed|\b4(?:00|22)\b",
        FailureClass::Permanent,
        FailureKind::InvalidRequest,
    ),
    (
        r"not found|no such|\b404\b",
        FailureClass::Permanent,
        FailureKind::NotFound,
    ),
];

fn standard_rules() -> &'static [ClassificationRule] {
    static RULES: OnceLock<Vec<ClassificationRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        STANDARD_RULES
            .iter()
            .filter_map(|(pattern, class, kind)| {
                ClassificationRule::new(pattern, *class, *kind)
                    .map_err(|e| tracing::error!(pattern, error = %e, "Invalid standard classification rule"))
                    .ok()
            })
            .collect()
    })
}

/// Classifies collaborator failures from an ordered rule table.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            rules: standard_rules().to_vec(),
        }
    }
}

impl FailureClassifier {
    /// Creates a classifier with the standard rule table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a classifier with no rules; everything is TRANSIENT.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Adds a rule ahead of all existing rules.
    pub fn with_rule(
        mut self,
        pattern: &str,
        class: FailureClass,
        kind: FailureKind,
    ) -> Result<Self, regex::Error> {
        self.rules.insert(0, ClassificationRule::new(pattern, class, kind)?);
        Ok(self)
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Classifies a collaborator failure.
    #[must_use]
    pub fn classify(&self, failure: &StageFailure) -> Classification {
        self.classify_message(&failure.to_string())
    }

    /// Classifies a raw failure message.
    #[must_use]
    pub fn classify_message(&self, message: &str) -> Classification {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(message))
            .unwrap_or(Classification {
                class: FailureClass::Transient,
                kind: FailureKind::Unclassified,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSIENT: &[(&str, FailureKind)] = &[
        ("request timed out after 30s", FailureKind::Timeout),
        ("Timeout waiting for response", FailureKind::Timeout),
        ("deadline exceeded", FailureKind::Timeout),
        ("Rate limit reached for model", FailureKind::RateLimit),
        ("429 Too Many Requests", FailureKind::RateLimit),
        ("upstream overloaded", FailureKind::RateLimit),
        ("connection reset by peer", FailureKind::Connection),
        ("Connection refused (os error 111)", FailureKind::Connection),
        ("broken pipe", FailureKind::Connection),
        ("502 Bad Gateway", FailureKind::ServerError),
        ("Internal Server Error", FailureKind::ServerError),
        ("service unavailable", FailureKind::ServerError),
    ];

    const PERMANENT: &[(&str, FailureKind)] = &[
        ("401 Unauthorized", FailureKind::Authentication),
        ("invalid api key provided", FailureKind::Authentication),
        ("Forbidden", FailureKind::Authentication),
        ("400 Bad Request: missing field", FailureKind::InvalidRequest),
        ("validation failed: prompt too long", FailureKind::InvalidRequest),
        ("model not found", FailureKind::NotFound),
        ("404", FailureKind::NotFound),
    ];

    #[test]
    fn test_transient_table() {
        let classifier = FailureClassifier::new();
        for (message, kind) in TRANSIENT {
            let c = classifier.classify_message(message);
            assert_eq!(c.class, FailureClass::Transient, "{message}");
            assert_eq!(c.kind, *kind, "{message}");
        }
    }

    #[test]
    fn test_permanent_table() {
        let classifier = FailureClassifier::new();
        for (message, kind) in PERMANENT {
            let c = classifier.classify_message(message);
            assert_eq!(c.class, FailureClass::Permanent, "{message}");
            assert_eq!(c.kind, *kind, "{message}");
        }
    }

    #[test]
    fn test_unmatched_is_transient() {
        let c = FailureClassifier::new().classify_message("something odd happened");
        assert_eq!(c.class, FailureClass::Transient);
        assert_eq!(c.kind, FailureKind::Unclassified);
    }

    #[test]
    fn test_status_code_participates() {
        let classifier = FailureClassifier::new();
        let c = classifier.classify(&StageFailure::with_status(503, "upstream"));
        assert_eq!(c.kind, FailureKind::ServerError);
        let c = classifier.classify(&StageFailure::with_status(404, "missing"));
        assert_eq!(c.class, FailureClass::Permanent);
    }

    #[test]
    fn test_first_match_wins() {
        // Matches both the timeout and the authentication rule.
        let c = FailureClassifier::new().classify_message("authentication refresh timed out");
        assert_eq!(c.kind, FailureKind::Timeout);
    }

    #[test]
    fn test_custom_rule_takes_precedence() {
        let classifier = FailureClassifier::new()
            .with_rule("quota exhausted", FailureClass::Permanent, FailureKind::RateLimit)
            .unwrap();
        let c = classifier.classify_message("Rate limit: quota exhausted for this month");
        assert_eq!(c.class, FailureClass::Permanent);
        assert_eq!(classifier.rule_count(), STANDARD_RULES.len() + 1);
    }

    #[test]
    fn test_invalid_custom_rule() {
        assert!(FailureClassifier::new()
            .with_rule("(unclosed", FailureClass::Permanent, FailureKind::NotFound)
            .is_err());
    }

    #[test]
    fn test_standard_rules_all_compile() {
        assert_eq!(FailureClassifier::new().rule_count(), STANDARD_RULES.len());
        assert_eq!(FailureClassifier::empty().rule_count(), 0);
    }
}
