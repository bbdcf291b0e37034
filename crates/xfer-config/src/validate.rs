//! Configuration validation
//!
//! Component configurations check their own fields; the rules here add the
//! checks that need more than one section at a time.

use crate::config::{LogConfig, LogOutput, ManagerConfig, NodeConfig, XferConfig};
use std::fmt;

/// Validation result containing errors and warnings
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Required,
    OutOfRange,
    InvalidFormat,
    Conflict,
}

/// Configuration validator
///
/// Strict mode adds warnings for settings that are legal but usually a
/// mistake in production.
#[derive(Debug)]
pub struct Validator {
    strict_mode: bool,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    #[must_use]
    pub fn validate(&self, config: &XferConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(self.validate_manager(&config.manager));
        result.merge(self.validate_node(&config.node));
        result.merge(self.validate_log(&config.log));

        for rule in [&SlotWeightRule as &dyn ValidationRule, &RetryWindowRule] {
            result.merge(rule.validate(config));
        }
        result
    }

    #[must_use]
    pub fn validate_manager(&self, config: &ManagerConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = config.dispatcher.validate() {
            result.add_error(ValidationError::new(
                "manager.dispatcher",
                e.to_string(),
                ErrorCode::OutOfRange,
            ));
        }
        if let Err(e) = config.placement.validate() {
            result.add_error(ValidationError::new(
                "manager.placement",
                e.to_string(),
                ErrorCode::OutOfRange,
            ));
        }

        let dispatcher = &config.dispatcher;
        if dispatcher.outcome_batch_size > dispatcher.outcome_queue_capacity {
            result.add_warning(ValidationWarning::with_suggestion(
                "manager.dispatcher.outcome_batch_size",
                format!(
                    "Batch size {} exceeds the outcome queue capacity {}",
                    dispatcher.outcome_batch_size, dispatcher.outcome_queue_capacity
                ),
                "Batches will only ever be flushed by the timer",
            ));
        }

        if self.strict_mode && dispatcher.max_scheduled_per_second.is_none() {
            result.add_warning(ValidationWarning::with_suggestion(
                "manager.dispatcher.max_scheduled_per_second",
                "Scheduling rate is unbounded",
                "Set a per-second quota to protect nodes during bursts",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_node(&self, config: &NodeConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        let checks = [
            ("node.agent", config.agent.validate()),
            ("node.admission", config.admission.validate()),
            ("node.running", config.running.validate()),
        ];
        for (field, check) in checks {
            if let Err(e) = check {
                result.add_error(ValidationError::new(field, e.to_string(), ErrorCode::OutOfRange));
            }
        }

        if config.admission.guaranteed_user_slot_percent == 100 {
            result.add_warning(ValidationWarning::with_suggestion(
                "node.admission.guaranteed_user_slot_percent",
                "Every slot is reserved for user transfers, backfill copy sources never start",
                "Lower the percentage to let replication use idle slots",
            ));
        }

        if self.strict_mode && config.admission.default_pending_timeout_secs.is_none() {
            result.add_warning(ValidationWarning::new(
                "node.admission.default_pending_timeout_secs",
                "Standard transfers without a service class timeout may stay queued forever",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if matches!(config.output, LogOutput::File | LogOutput::Both) && config.file_path.is_none()
        {
            result.add_error(ValidationError::new(
                "log.file_path",
                "file_path must be set when output is 'file' or 'both'",
                ErrorCode::Required,
            ));
        }

        let filter = xfer_telemetry::LogConfig {
            level: config.level,
            directives: config.directives.clone(),
            ..xfer_telemetry::LogConfig::default()
        };
        if let Err(e) = xfer_telemetry::build_filter(&filter) {
            result.add_error(ValidationError::new(
                "log.directives",
                e.to_string(),
                ErrorCode::InvalidFormat,
            ));
        }
        result
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Check spanning several sections
pub trait ValidationRule {
    fn validate(&self, config: &XferConfig) -> ValidationResult;
    fn name(&self) -> &str;
}

/// A transfer weighing more than the node's slots could never start
pub struct SlotWeightRule;

impl ValidationRule for SlotWeightRule {
    fn validate(&self, config: &XferConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let total = config.node.admission.total_slots;
        let running = &config.node.running;

        if running.default_weight > total {
            result.add_error(ValidationError::new(
                "node.running.default_weight",
                format!("Weight {} exceeds the {total} slots of the node", running.default_weight),
                ErrorCode::Conflict,
            ));
        }
        let mut protocols: Vec<_> = running.protocol_weights.iter().collect();
        protocols.sort();
        for (protocol, weight) in protocols {
            if *weight > total {
                result.add_error(ValidationError::new(
                    format!("node.running.protocol_weights.{protocol}"),
                    format!("Weight {weight} exceeds the {total} slots of the node"),
                    ErrorCode::Conflict,
                ));
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "SlotWeightRule"
    }
}

/// A start retried after a lost answer must still find the first start
/// in the recent-start memory, or it is refused as a lost race
pub struct RetryWindowRule;

impl ValidationRule for RetryWindowRule {
    fn validate(&self, config: &XferConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let bucket = config.manager.placement.recent_start_bucket_ms;
        let retry = config.node.agent.remote_timeout_ms;
        if bucket < retry.saturating_mul(2) {
            result.add_warning(ValidationWarning::with_suggestion(
                "manager.placement.recent_start_bucket_ms",
                format!("Recent starts are kept for as little as {bucket}ms but nodes wait up to {retry}ms for an answer"),
                "Keep the bucket at least twice the node remote timeout",
            ));
        }
        result
    }

    fn name(&self) -> &'static str {
        "RetryWindowRule"
    }
}

/// Validate with the default validator
#[must_use]
pub fn validate_config(config: &XferConfig) -> ValidationResult {
    Validator::new().validate(config)
}
