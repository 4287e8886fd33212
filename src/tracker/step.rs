//! Step registration for test cases

use super::state::CaseState;
use crate::error::{EngineError, Result};
use crate::pause::PauseGate;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

static STEP_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^step_([^_]+)_(.+)$").expect("Invalid regex pattern"));

/// A step name such as `step_03_confirm_order`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName {
    raw: String,
    number: Option<String>,
    words: String,
}

impl StepName {
    /// Split a conventional `step_<N>_<words>` name. Other names are kept
    /// whole with no number.
    pub fn parse(raw: &str) -> Self {
        match STEP_NAME_PATTERN.captures(raw) {
            Some(caps) => Self {
                raw: raw.to_string(),
                number: Some(caps[1].to_string()),
                words: caps[2].replace('_', " "),
            },
            None => Self {
                raw: raw.to_string(),
                number: None,
                words: raw.replace('_', " "),
            },
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn words(&self) -> &str {
        &self.words
    }

    /// Human-readable label, e.g. `Step 03: confirm order`
    pub fn label(&self) -> String {
        match &self.number {
            Some(number) => format!("Step {number}: {}", self.words),
            None => format!("Step: {}", self.words),
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The body of a step
#[async_trait]
pub trait StepBody: Send + Sync {
    async fn execute(&self, state: &mut CaseState) -> anyhow::Result<()>;
}

/// Adapter for synchronous closures
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F> StepBody for FnStep<F>
where
    F: Fn(&mut CaseState) -> anyhow::Result<()> + Send + Sync,
{
    async fn execute(&self, state: &mut CaseState) -> anyhow::Result<()> {
        (self.0)(state)
    }
}

/// A registered step: name, description, optional pause gate and body
pub struct Step {
    pub(crate) name: StepName,
    pub(crate) description: String,
    pub(crate) gate: Option<PauseGate>,
    pub(crate) body: Box<dyn StepBody>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name.as_str())
            .field("description", &self.description)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl Step {
    pub fn new(name: &str, body: impl StepBody + 'static) -> Self {
        let name = StepName::parse(name);
        Self {
            description: name.words().to_string(),
            name,
            gate: None,
            body: Box::new(body),
        }
    }

    /// Build a step from a synchronous closure
    pub fn from_fn<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut CaseState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, FnStep(body))
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn gate(mut self, gate: PauseGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn name(&self) -> &StepName {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pause_gate(&self) -> Option<&PauseGate> {
        self.gate.as_ref()
    }
}

pub type ResumeHook = Box<dyn Fn(&mut CaseState) -> anyhow::Result<()> + Send + Sync>;

/// An ordered set of steps under a case name
pub struct TestCase {
    name: String,
    description: Option<String>,
    pub(crate) steps: Vec<Step>,
    pub(crate) on_resume: Option<ResumeHook>,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("on_resume", &self.on_resume.is_some())
            .finish()
    }
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            on_resume: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a step; steps run in registration order
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Hook run once before the first step of a replayed run
    pub fn on_resume<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut CaseState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_resume = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.name.as_str().to_string())
            .collect()
    }

    /// Reject empty case names, empty step names and duplicate steps
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('_') {
            return Err(EngineError::invalid_step(format!(
                "case name '{}' must be non-empty and contain no '_'",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name.as_str();
            if name.is_empty() {
                return Err(EngineError::invalid_step(format!(
                    "empty step name in case '{}'",
                    self.name
                )));
            }
            if !seen.insert(name) {
                return Err(EngineError::invalid_step(format!(
                    "step '{name}' registered twice in case '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
