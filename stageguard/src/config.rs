//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Values are checked by [`EngineConfig::validate`], which
//! [`crate::workflow::SupervisorBuilder::build`] calls before anything runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointConfig;
use crate::errors::ConfigError;
use crate::hitl::{ApprovalConfig, EscalationConfig};
use crate::resilience::{
    BackoffPolicy, BreakerConfig, ClassificationRule, FailureClass, FailureClassifier, FailureKind,
};
use crate::workflow::StageDefaults;

/// Default cap on stage invocations per run.
pub const DEFAULT_MAX_TOTAL_INVOCATIONS: u32 = 25;

/// An extra classification rule, checked before the standard table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Case-insensitive regular expression matched against the failure text.
    pub pattern: String,
    /// Class assigned on match.
    pub class: FailureClass,
    /// Sub-kind recorded on match.
    #[serde(default = "default_rule_kind")]
    pub kind: FailureKind,
}

fn default_rule_kind() -> FailureKind {
    FailureKind::Unclassified
}

/// Classifier settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Rules evaluated ahead of the standard table, first match wins.
    #[serde(default)]
    pub extra_rules: Vec<RuleConfig>,
}

impl ClassifierConfig {
    /// Builds the classifier: `extra_rules` in order, then the standard table.
    pub fn build(&self) -> Result<FailureClassifier, ConfigError> {
        self.extra_rules
            .iter()
            .rev()
            .try_fold(FailureClassifier::new(), |classifier, rule| {
                classifier
                    .with_rule(&rule.pattern, rule.class, rule.kind)
                    .map_err(|e| {
                        ConfigError::Invalid(format!(
                            "classifier rule '{}' is not a valid pattern: {e}",
                            rule.pattern
                        ))
                    })
            })
    }

    /// Checks every pattern compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.extra_rules {
            ClassificationRule::new(&rule.pattern, rule.class, rule.kind).map_err(|e| {
                ConfigError::Invalid(format!(
                    "classifier rule '{}' is not a valid pattern: {e}",
                    rule.pattern
                ))
            })?;
        }
        Ok(())
    }
}

/// Configuration for a supervisor and everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Wait between retries.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Hard cap on stage invocations per run.
    #[serde(default = "default_max_total_invocations")]
    pub max_total_invocations: u32,
    /// Retry budget and timeout for stages that do not set their own.
    #[serde(default)]
    pub stage_defaults: StageDefaults,
    /// Approval wait policy.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Escalation wait policy.
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Failure classification rules.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Checkpoint storage.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_max_total_invocations() -> u32 {
    DEFAULT_MAX_TOTAL_INVOCATIONS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            backoff: BackoffPolicy::default(),
            max_total_invocations: default_max_total_invocations(),
            stage_defaults: StageDefaults::default(),
            approval: ApprovalConfig::default(),
            escalation: EscalationConfig::default(),
            classifier: ClassifierConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Sets the breaker thresholds.
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the invocation cap.
    #[must_use]
    pub fn with_max_total_invocations(mut self, cap: u32) -> Self {
        self.max_total_invocations = cap;
        self
    }

    /// Sets the stage defaults.
    #[must_use]
    pub fn with_stage_defaults(mut self, defaults: StageDefaults) -> Self {
        self.stage_defaults = defaults;
        self
    }

    /// Sets the approval wait policy.
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }

    /// Sets the escalation wait policy.
    #[must_use]
    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    /// Adds a classification rule ahead of those already configured.
    #[must_use]
    pub fn with_classifier_rule(
        mut self,
        pattern: impl Into<String>,
        class: FailureClass,
        kind: FailureKind,
    ) -> Self {
        self.classifier.extra_rules.insert(
            0,
            RuleConfig {
                pattern: pattern.into(),
                class,
                kind,
            },
        );
        self
    }

    /// Stores checkpoints as files under `directory`.
    #[must_use]
    pub fn with_checkpoint_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.checkpoint.directory = Some(directory.into());
        self
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.backoff.validate()?;
        if self.max_total_invocations == 0 {
            return Err(ConfigError::Invalid(
                "max_total_invocations must be at least 1".to_string(),
            ));
        }
        self.stage_defaults.validate()?;
        self.approval.validate()?;
        self.escalation.validate()?;
        self.classifier.validate()?;
        self.checkpoint.validate()
    }

    /// Builds the failure classifier.
    pub fn build_classifier(&self) -> Result<FailureClassifier, ConfigError> {
        self.classifier.build()
    }
}
