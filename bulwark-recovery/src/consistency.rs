//! Sampled consistency checks on successful recovery output

use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Validates the output of a successful operation
pub trait ConsistencyValidator: Send + Sync {
    fn validate(&self, output: &Value) -> Result<(), String>;
}

/// Requires the output to be an object with non-null fields
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    fields: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ConsistencyValidator for RequiredFieldsValidator {
    fn validate(&self, output: &Value) -> Result<(), String> {
        let object = output
            .as_object()
            .ok_or_else(|| "expected an object payload".to_string())?;

        for field in &self.fields {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required field '{}'", field));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Validators keyed by operation type, applied to a sample of successes
pub struct ConsistencyChecker {
    sample_rate: f64,
    validators: RwLock<HashMap<String, Arc<dyn ConsistencyValidator>>>,
}

impl ConsistencyChecker {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Checker with the built-in session validator
    pub fn with_defaults(sample_rate: f64) -> Self {
        let checker = Self::new(sample_rate);
        checker.register(
            "session",
            Arc::new(RequiredFieldsValidator::new(["user_id", "session_id"])),
        );
        checker
    }

    pub fn register(&self, operation_type: impl Into<String>, validator: Arc<dyn ConsistencyValidator>) {
        self.validators.write().insert(operation_type.into(), validator);
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn should_sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            true
        } else if self.sample_rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen_bool(self.sample_rate)
        }
    }

    /// Validate `output` if this operation type has a validator and the
    /// sample selects it. `None` means no check ran.
    pub fn check(&self, operation_type: &str, output: &Value) -> Option<Result<(), String>> {
        let validator = self.validators.read().get(operation_type).cloned()?;
        if !self.should_sample() {
            return None;
        }
        Some(validator.validate(output))
    }
}
