use crate::action::{Action, ActionError, ActionOutcome, StepContext};

/// Moves simulated time forward by a random amount.
#[derive(Debug, Clone)]
pub struct AdvanceTime {
    pub lower_ms: u64,
    pub upper_ms: u64,
}

impl Default for AdvanceTime {
    fn default() -> Self {
        Self {
            lower_ms: 1,
            upper_ms: 100,
        }
    }
}

impl Action for AdvanceTime {
    fn name(&self) -> &str {
        "AdvanceTime"
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        let now = ctx
            .controller
            .advance_time(&ctx.rng, self.lower_ms, self.upper_ms)?;
        tracing::debug!(step = ctx.step, %now, "Advanced time");
        Ok(ActionOutcome::Completed)
    }
}
