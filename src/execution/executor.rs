use crate::models::{Direction, Side};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionAction {
    /// Market order into `direction`; multiplier 2 reverses an opposite position
    Open { direction: Direction, multiplier: u32 },
    /// Market order closing the position in `closing`
    Flatten { closing: Direction, multiplier: u32 },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

/// Map a side change to the single order that performs it
///
/// FLAT → LONG/SHORT opens one unit, LONG ↔ SHORT opens two (one closes the
/// old exposure), LONG/SHORT → FLAT closes one. Anything else is a no-op.
pub fn plan_transition(current: Side, target: Side) -> ExecutionDecision {
    match (current.direction(), target.direction()) {
        (None, Some(direction)) => ExecutionDecision {
            action: ExecutionAction::Open {
                direction,
                multiplier: 1,
            },
            reason: format!("Entering {} from flat", direction),
        },
        (Some(from), Some(to)) if from != to => ExecutionDecision {
            action: ExecutionAction::Open {
                direction: to,
                multiplier: 2,
            },
            reason: format!("Reversing {} -> {}", from, to),
        },
        (Some(from), None) => ExecutionDecision {
            action: ExecutionAction::Flatten {
                closing: from,
                multiplier: 1,
            },
            reason: format!("Closing {} position", from),
        },
        _ => ExecutionDecision {
            action: ExecutionAction::Skip,
            reason: format!("Holding {}", current),
        },
    }
}
