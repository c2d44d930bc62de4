//! Legal lifecycle transitions and the workshop aggregate rule.
//!
//! Everything here is pure. Callers pass the current status, the requested
//! one, and whatever context a rule needs; nothing touches the store.

use crate::attendee::AttendeeStatus;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::workshop::WorkshopStatus;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Workshop,
    Attendee,
}

/// Facts about the surrounding world that some transitions depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Attendees of the workshop currently deploying or active.
    pub busy_attendees: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionCheck {
    pub valid: bool,
    pub error_code: Option<ErrorCode>,
}

impl TransitionCheck {
    pub const VALID: TransitionCheck = TransitionCheck {
        valid: true,
        error_code: None,
    };

    pub fn invalid(code: ErrorCode) -> Self {
        Self {
            valid: false,
            error_code: Some(code),
        }
    }

    /// Turn a failed check into a rejection carrying `message`.
    pub fn into_result(self, message: impl FnOnce() -> String) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        Err(OrchestratorError::rejected(
            self.error_code.unwrap_or(ErrorCode::InvalidTransition),
            message(),
        ))
    }
}

/// A status enum with a fixed transition table.
pub trait Lifecycle: Copy + Eq + Debug + Display + FromStr + 'static {
    const KIND: EntityKind;

    fn transitions() -> &'static [(Self, Self)];

    fn can_transition(from: Self, to: Self) -> bool {
        Self::transitions().contains(&(from, to))
    }

    /// Entering `to` requires that no attendee is deploying or active.
    fn requires_idle(_to: Self) -> bool {
        false
    }
}

const WORKSHOP_TRANSITIONS: &[(WorkshopStatus, WorkshopStatus)] = {
    use WorkshopStatus::*;
    &[
        (Planning, Deploying),
        (Planning, Deleting),
        (Planning, Deleted),
        (Deploying, Active),
        (Deploying, Failed),
        (Deploying, Deleting),
        (Active, Completed),
        (Active, Deploying),
        (Active, Deleting),
        (Completed, Deleting),
        (Failed, Deploying),
        (Failed, Deleting),
        (Deleting, Deleted),
        (Deleting, Failed),
    ]
};

const ATTENDEE_TRANSITIONS: &[(AttendeeStatus, AttendeeStatus)] = {
    use AttendeeStatus::*;
    &[
        (Planning, Deploying),
        (Planning, Deleting),
        (Deploying, Active),
        (Deploying, Failed),
        (Active, Deleting),
        (Failed, Deploying),
        (Failed, Deleting),
        (Deleting, Deleted),
        (Deleting, Failed),
    ]
};

impl Lifecycle for WorkshopStatus {
    const KIND: EntityKind = EntityKind::Workshop;

    fn transitions() -> &'static [(Self, Self)] {
        WORKSHOP_TRANSITIONS
    }

    fn requires_idle(to: Self) -> bool {
        to == WorkshopStatus::Deleted
    }
}

impl Lifecycle for AttendeeStatus {
    const KIND: EntityKind = EntityKind::Attendee;

    fn transitions() -> &'static [(Self, Self)] {
        ATTENDEE_TRANSITIONS
    }
}

/// Check one transition against the table and the context rules.
pub fn check<S: Lifecycle>(from: S, to: S, context: &TransitionContext) -> TransitionCheck {
    if !S::can_transition(from, to) {
        return TransitionCheck::invalid(ErrorCode::InvalidTransition);
    }
    if S::requires_idle(to) && context.busy_attendees > 0 {
        return TransitionCheck::invalid(ErrorCode::DeleteBlocked);
    }
    TransitionCheck::VALID
}

/// Validate a transition given statuses by name.
///
/// Unknown status names are rejected with `UNKNOWN_STATUS`.
pub fn validate_transition(
    kind: EntityKind,
    from: &str,
    to: &str,
    context: &TransitionContext,
) -> TransitionCheck {
    fn parsed<S: Lifecycle>(from: &str, to: &str, context: &TransitionContext) -> TransitionCheck {
        match (from.parse::<S>(), to.parse::<S>()) {
            (Ok(from), Ok(to)) => check(from, to, context),
            _ => TransitionCheck::invalid(ErrorCode::UnknownStatus),
        }
    }

    match kind {
        EntityKind::Workshop => parsed::<WorkshopStatus>(from, to, context),
        EntityKind::Attendee => parsed::<AttendeeStatus>(from, to, context),
    }
}

/// A workshop record may be removed only while nothing it owns is live.
pub fn check_workshop_removal(context: &TransitionContext) -> TransitionCheck {
    if context.busy_attendees > 0 {
        TransitionCheck::invalid(ErrorCode::DeleteBlocked)
    } else {
        TransitionCheck::VALID
    }
}

/// Attendees join a workshop only before it is first deployed.
pub fn check_attendee_addition(workshop: WorkshopStatus) -> TransitionCheck {
    if workshop == WorkshopStatus::Planning {
        TransitionCheck::VALID
    } else {
        TransitionCheck::invalid(ErrorCode::WorkshopNotPlanning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveState {
    pub status: WorkshopStatus,
    /// Some attendees failed while others are still being worked on.
    pub degraded: bool,
}

/// Derive a workshop status from its attendees. First matching rule wins:
///
/// 1. no attendees: the stored status, unchanged
/// 2. all active: `active`
/// 3. all deleted: `deleted`
/// 4. any active or deploying: `deploying`, degraded if any failed
/// 5. any failed: `failed`
/// 6. any deleting: `deleting`
/// 7. otherwise `planning`
pub fn compute_workshop_state(
    attendees: &[AttendeeStatus],
    stored: WorkshopStatus,
) -> EffectiveState {
    let healthy = |status| EffectiveState {
        status,
        degraded: false,
    };

    if attendees.is_empty() {
        return healthy(stored);
    }

    let all = |wanted: AttendeeStatus| attendees.iter().all(|s| *s == wanted);
    let any = |wanted: AttendeeStatus| attendees.contains(&wanted);

    if all(AttendeeStatus::Active) {
        healthy(WorkshopStatus::Active)
    } else if all(AttendeeStatus::Deleted) {
        healthy(WorkshopStatus::Deleted)
    } else if any(AttendeeStatus::Active) || any(AttendeeStatus::Deploying) {
        EffectiveState {
            status: WorkshopStatus::Deploying,
            degraded: any(AttendeeStatus::Failed),
        }
    } else if any(AttendeeStatus::Failed) {
        healthy(WorkshopStatus::Failed)
    } else if any(AttendeeStatus::Deleting) {
        healthy(WorkshopStatus::Deleting)
    } else {
        healthy(WorkshopStatus::Planning)
    }
}
