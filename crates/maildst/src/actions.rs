//! The actions a mail pipeline simulation picks from.
//!
//! | action        | weight |
//! |---------------|--------|
//! | `AdvanceTime` | 1.0    |
//! | `AddUser`     | 0.2    |
//! | `RemoveUser`  | 0.1    |
//! | `ModifyUser`  | 0.15   |
//! | `SendEmail`   | 1.0    |

use std::sync::Arc;

use crate::{
    action::{Action, ActionSet},
    config::{ConfigError, SimulationConfig},
};

mod email;
mod time;
mod user;

pub use email::{EmailValidator, SendEmail, DELIVERY_TIMEOUT};
pub use time::AdvanceTime;
pub use user::{AddUser, ModifyUser, RemoveUser};

/// Every built-in action, in registration order.
pub fn default_actions(config: &SimulationConfig) -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(AdvanceTime::default()),
        Arc::new(AddUser),
        Arc::new(RemoveUser),
        Arc::new(ModifyUser),
        Arc::new(SendEmail {
            queue_timeout: config.environment.queue_timeout(),
        }),
    ]
}

pub fn default_action_set(config: &SimulationConfig) -> Result<ActionSet, ConfigError> {
    ActionSet::new(default_actions(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_weights() {
        let set = default_action_set(&SimulationConfig::default()).unwrap();
        let weights: Vec<_> = set.iter().map(|a| (a.name().to_owned(), a.weight())).collect();
        assert_eq!(
            weights,
            vec![
                ("AdvanceTime".to_owned(), 1.0),
                ("AddUser".to_owned(), 0.2),
                ("RemoveUser".to_owned(), 0.1),
                ("ModifyUser".to_owned(), 0.15),
                ("SendEmail".to_owned(), 1.0),
            ]
        );
        assert!((set.total_weight() - 2.45).abs() < 1e-9);
    }
}
