//! Admission control for new sessions.
//!
//! Clients probing credentials open fresh connections for every guess, so
//! the brake is applied where those connections enter: each session-init
//! attempt costs one permit, and the permit replenishment rate collapses
//! geometrically while failures keep arriving, then recovers linearly
//! once logins succeed again.

/// Consecutive failures before throttling engages.
const FAILURE_THRESHOLD: u32 = 3;

/// Permits replenished per scheduler tick when healthy.
const RATE_CEILING: f64 = 1.0;

/// Replenishment floor: one admission roughly every 64 ticks.
const RATE_FLOOR: f64 = 1.0 / 64.0;

/// Multiplier applied to the rate on each failure past the threshold.
const RATE_DECAY: f64 = 0.5;

/// Linear rate recovery per successful credential check.
const RATE_RESTORE: f64 = 0.125;

/// Burst budget of admissions while throttled.
const PERMIT_CEILING: f64 = 4.0;

/// Tracks recent credential-check outcomes and throttles session-init
/// admission accordingly.
///
/// Owned and driven by exactly one scheduler: [`tick`](Self::tick) runs
/// once per admission pass, [`validate`](Self::validate) after every
/// credential check, and
/// [`can_handle_next_session_init_task`](Self::can_handle_next_session_init_task)
/// before every init attempt.
#[derive(Debug)]
pub struct SessionValidator {
    permits: f64,
    replenish_rate: f64,
    consecutive_failures: u32,
}

impl SessionValidator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: PERMIT_CEILING,
            replenish_rate: RATE_CEILING,
            consecutive_failures: 0,
        }
    }

    /// Record the outcome of one credential check.
    pub fn validate(&mut self, is_auth_correct: bool) {
        if is_auth_correct {
            self.consecutive_failures = 0;
            self.replenish_rate = (self.replenish_rate + RATE_RESTORE).min(RATE_CEILING);
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= FAILURE_THRESHOLD {
                self.replenish_rate = (self.replenish_rate * RATE_DECAY).max(RATE_FLOOR);
            }
        }
    }

    /// Replenish the permit budget. Called once per admission pass.
    pub fn tick(&mut self) {
        self.permits = (self.permits + self.replenish_rate).min(PERMIT_CEILING);
    }

    /// Whether the next session-init task may be attempted.
    ///
    /// Healthy (rate at ceiling) admission is unmetered; under failure
    /// pressure the burst budget gates each attempt.
    #[must_use]
    pub fn can_handle_next_session_init_task(&self) -> bool {
        self.replenish_rate >= RATE_CEILING || self.permits >= 1.0
    }

    /// Charge one admission against the permit budget.
    pub fn note_admission(&mut self) {
        self.permits = (self.permits - 1.0).max(0.0);
    }

    /// Whether throttling is currently engaged, for logging.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.replenish_rate < RATE_CEILING
    }
}

impl Default for SessionValidator {
    fn default() -> Self {
        Self::new()
    }
}
