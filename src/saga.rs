//! Ordered forward/compensate steps over more than one store path.
//!
//! Rolls back only on an explicit business halt. An infrastructure error
//! means the step's effect is unknown, so nothing is compensated; the
//! operation is idempotent by id and the reconciliation sweep or a retry
//! finishes it.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

/// What a forward step decided.
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Business rejection; nothing was changed by this step.
    Halt(LedgerError),
}

#[async_trait]
pub trait SagaStep<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn forward(&self, ctx: &mut C) -> Result<Step>;

    /// Must be safe to run more than once.
    async fn compensate(&self, ctx: &mut C) -> Result<()>;
}

#[derive(Debug)]
pub enum SagaOutcome {
    Completed,
    /// Halted and every completed step was compensated.
    RolledBack(LedgerError),
}

pub struct Saga<C> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Send> Saga<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self, ctx: &mut C) -> Result<SagaOutcome> {
        for (idx, step) in self.steps.iter().enumerate() {
            match step.forward(ctx).await? {
                Step::Continue => {
                    debug!(saga = self.name, step = step.name(), "saga step done");
                }
                Step::Halt(reason) => {
                    warn!(
                        saga = self.name,
                        step = step.name(),
                        reason = %reason,
                        "↩️ saga halted, compensating"
                    );
                    for done in self.steps[..idx].iter().rev() {
                        done.compensate(ctx).await?;
                        debug!(saga = self.name, step = done.name(), "saga step compensated");
                    }
                    return Ok(SagaOutcome::RolledBack(reason));
                }
            }
        }
        Ok(SagaOutcome::Completed)
    }
}
