//! Actions mutating the synthetic user pool.

use crate::action::{Action, ActionError, ActionOutcome, StepContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct AddUser;

impl Action for AddUser {
    fn name(&self) -> &str {
        "AddUser"
    }

    fn weight(&self) -> f64 {
        0.2
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.generator.add_random_user(&ctx.rng);
        Ok(ActionOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveUser;

impl Action for RemoveUser {
    fn name(&self) -> &str {
        "RemoveUser"
    }

    fn weight(&self) -> f64 {
        0.1
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.generator.remove_random_user(&ctx.rng)?;
        Ok(ActionOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModifyUser;

impl Action for ModifyUser {
    fn name(&self) -> &str {
        "ModifyUser"
    }

    fn weight(&self) -> f64 {
        0.15
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.generator.modify_random_user(&ctx.rng)?;
        Ok(ActionOutcome::Completed)
    }
}
