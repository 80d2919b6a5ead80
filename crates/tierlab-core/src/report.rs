//! Per-step outcomes of a lifecycle command.

use crate::command::LifecycleCommand;
use crate::error::{CoreError, Result};
use std::fmt;
use tierlab_vm::{ResourceId, ResourceState};

/// What happened to one step.
#[derive(Debug)]
pub enum Outcome {
    /// The substrate was changed
    Applied,
    /// The resource was already in the target state
    AlreadySatisfied,
    /// The step failed; the command stopped here
    Failed(CoreError),
    /// An earlier step failed
    NotAttempted,
}

impl Outcome {
    /// Short label for listings.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::AlreadySatisfied => "ok",
            Outcome::Failed(_) => "FAILED",
            Outcome::NotAttempted => "skipped",
        }
    }
}

/// One step of a command's plan.
#[derive(Debug)]
pub struct StepOutcome {
    /// Resource the step acts on
    pub resource: ResourceId,
    /// State the step drives the resource towards
    pub target: ResourceState,
    /// Result
    pub outcome: Outcome,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8} {:<28} -> {}", self.outcome.label(), self.resource, self.target)?;
        if let Outcome::Failed(err) = &self.outcome {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

/// Ordered outcomes of every step a command planned.
#[derive(Debug)]
pub struct CommandReport {
    /// Command that was executed
    pub command: LifecycleCommand,
    /// Steps in execution order
    pub steps: Vec<StepOutcome>,
}

impl CommandReport {
    /// Empty report for `command`.
    pub fn new(command: LifecycleCommand) -> Self {
        Self {
            command,
            steps: Vec::new(),
        }
    }

    /// Steps that changed the substrate.
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Applied))
    }

    /// Steps that found their resource already in place.
    pub fn satisfied(&self) -> usize {
        self.count(|o| matches!(o, Outcome::AlreadySatisfied))
    }

    /// Steps that failed (zero or one).
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    /// Steps skipped after a failure.
    pub fn not_attempted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::NotAttempted))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.outcome)).count()
    }

    /// Whether every step succeeded.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.not_attempted() == 0
    }

    /// The step that stopped the command, if any.
    pub fn first_failure(&self) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, Outcome::Failed(_)))
    }

    /// Convert into a `Result`, surfacing the failing step as
    /// [`CoreError::StepFailed`].
    pub fn into_result(self) -> Result<Self> {
        let Some(pos) = self
            .steps
            .iter()
            .position(|s| matches!(s.outcome, Outcome::Failed(_)))
        else {
            return Ok(self);
        };

        let mut steps = self.steps;
        let step = steps.swap_remove(pos);
        match step.outcome {
            Outcome::Failed(source) => Err(CoreError::StepFailed {
                command: self.command,
                resource: step.resource,
                target: step.target,
                source: Box::new(source),
            }),
            // `pos` points at a failed step.
            _ => Ok(Self {
                command: self.command,
                steps,
            }),
        }
    }
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(f, "{step}")?;
        }
        write!(
            f,
            "{}: {} applied, {} already satisfied, {} failed, {} not attempted",
            self.command,
            self.applied(),
            self.satisfied(),
            self.failed(),
            self.not_attempted()
        )
    }
}
