//! Immutable saga and step definitions.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_kind::ErrorKind;

/// Retry schedule for a single step: exponential backoff with jitter,
/// bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Multiplier applied per retry.
    #[serde(default = "default_factor")]
    pub factor: u32,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Total invocation attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_ms() -> u64 {
    50
}

fn default_factor() -> u32 {
    2
}

fn default_cap_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    4
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Returns the un-jittered backoff delay preceding the given retry.
    ///
    /// `retry` is zero-based: 0 is the delay between the first and
    /// second attempts.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = u64::from(self.factor).saturating_pow(retry);
        let delay_ms = self.base_ms.saturating_mul(factor).min(self.cap_ms);
        Duration::from_millis(delay_ms)
    }
}

/// One step of a saga: a forward invocation and its optional compensator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the definition.
    pub name: String,
    /// Participant that owns this step's targets.
    pub service: String,
    /// Operation invoked for forward execution.
    pub invoke_target: String,
    /// Operation that undoes the step. `None` means the step has no side
    /// effect to undo and is treated as instantly compensated.
    #[serde(default)]
    pub compensate_target: Option<String>,
    /// Per-attempt deadline, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry schedule for the adapter.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Error kinds the adapter may retry for this step. Kinds outside
    /// this set fail the step on first occurrence.
    #[serde(default = "default_retryable_kinds")]
    pub retryable_error_kinds: Vec<ErrorKind>,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_retryable_kinds() -> Vec<ErrorKind> {
    vec![ErrorKind::Transient, ErrorKind::Unavailable, ErrorKind::Timeout]
}

impl StepDefinition {
    /// Creates a step with default timeout, retry, and retryable kinds.
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        invoke_target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            invoke_target: invoke_target.into(),
            compensate_target: None,
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            retryable_error_kinds: default_retryable_kinds(),
        }
    }

    /// Sets the compensating operation.
    pub fn with_compensation(mut self, target: impl Into<String>) -> Self {
        self.compensate_target = Some(target.into());
        self
    }

    /// Sets the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the retry schedule.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the per-attempt deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns true if the adapter may retry this kind for this step.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind.is_retryable() && self.retryable_error_kinds.contains(&kind)
    }
}

/// An ordered, immutable list of steps a saga instance follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Definition identifier referenced by saga instances.
    pub id: String,
    /// Steps in execution order.
    pub steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    /// Creates a definition, validating its shape.
    pub fn new(
        id: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Result<Self, DefinitionError> {
        let def = Self { id: id.into(), steps };
        def.validate()?;
        Ok(def)
    }

    /// Validates the definition shape.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() || step.service.is_empty() || step.invoke_target.is_empty() {
                return Err(DefinitionError::IncompleteStep {
                    definition: self.id.clone(),
                    index: i,
                });
            }
        }
        let mut names: Vec<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.steps.len() {
            return Err(DefinitionError::DuplicateStepName(self.id.clone()));
        }
        Ok(())
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Validation errors for saga definitions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition id must not be empty")]
    EmptyId,

    #[error("definition '{0}' has no steps")]
    NoSteps(String),

    #[error("definition '{definition}' step {index} is missing a name, service, or target")]
    IncompleteStep { definition: String, index: usize },

    #[error("definition '{0}' has duplicate step names")]
    DuplicateStepName(String),
}

/// Registry of saga definitions known to a coordinator instance.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, SagaDefinition>,
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing any previous one with the same id.
    pub fn register(&mut self, definition: SagaDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    /// Looks up a definition by id.
    pub fn get(&self, id: &str) -> Option<&SagaDefinition> {
        self.definitions.get(id)
    }

    /// Returns the number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns true if no definitions are registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
