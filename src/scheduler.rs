use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Self-rescheduling poll timer. At most one wake-up is ever pending.
///
/// The wall-clock time is what gets persisted; the monotonic deadline is
/// what the actor actually sleeps on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollScheduler {
    #[default]
    Idle,
    Armed { at: DateTime<Utc>, deadline: Instant },
}

impl PollScheduler {
    /// Scheduler for a freshly started actor, honoring a persisted wake-up.
    ///
    /// A missing or past wake-up means "poll now".
    pub fn restore(persisted: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        match persisted {
            Some(at) if at > now => {
                let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                Self::Armed {
                    at,
                    deadline: Instant::now() + wait,
                }
            }
            _ => Self::Armed {
                at: now,
                deadline: Instant::now(),
            },
        }
    }

    /// Arm a wake-up `delay` from now.
    ///
    /// No-op (returns `false`) if a wake-up is already pending in the future.
    pub fn arm(&mut self, delay: Duration) -> bool {
        if self.is_pending() {
            return false;
        }
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *self = Self::Armed {
            at,
            deadline: Instant::now() + delay,
        };
        true
    }

    /// Arm an immediate wake-up unless a future one is already pending.
    pub fn arm_now(&mut self) -> bool {
        self.arm(Duration::ZERO)
    }

    /// Called when the wake-up fires: back to `Idle`.
    pub fn fire(&mut self) {
        *self = Self::Idle;
    }

    /// Drop any pending wake-up.
    pub fn disarm(&mut self) {
        *self = Self::Idle;
    }

    /// True when armed for a time that has not yet passed.
    pub fn is_pending(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Armed { deadline, .. } => *deadline > Instant::now(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::Armed { deadline, .. } => Some(*deadline),
        }
    }

    /// Wall-clock time of the pending wake-up, for persistence.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Idle => None,
            Self::Armed { at, .. } => Some(*at),
        }
    }
}
