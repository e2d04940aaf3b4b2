//! Process-wide health indicator.
//!
//! A single code shared by every pipeline component: repeated flush
//! failures escalate to `Fatal`, which stays latched until an operator
//! resets it through the admin surface.

use std::sync::atomic::{AtomicU8, Ordering};

/// Health code for the indexing process
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HealthCode {
    Ok = 0,
    Warn = 1,
    Fatal = 2,
}

impl HealthCode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthCode::Ok,
            1 => HealthCode::Warn,
            _ => HealthCode::Fatal,
        }
    }
}

impl std::fmt::Display for HealthCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCode::Ok => write!(f, "OK"),
            HealthCode::Warn => write!(f, "WARN"),
            HealthCode::Fatal => write!(f, "FATAL"),
        }
    }
}

static HEALTH: AtomicU8 = AtomicU8::new(0);

/// Current health code.
pub fn current() -> HealthCode {
    HealthCode::from_u8(HEALTH.load(Ordering::Acquire))
}

/// Raise to WARN. Never downgrades an existing FATAL.
pub fn set_warn() {
    HEALTH.fetch_max(HealthCode::Warn as u8, Ordering::AcqRel);
}

/// Latch FATAL.
pub fn set_fatal() {
    HEALTH.store(HealthCode::Fatal as u8, Ordering::Release);
}

/// Reset to OK. Operator action through the admin surface.
pub fn reset() {
    HEALTH.store(HealthCode::Ok as u8, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_and_reset() {
        reset();
        assert_eq!(current(), HealthCode::Ok);

        set_warn();
        assert_eq!(current(), HealthCode::Warn);

        set_fatal();
        // WARN must not mask a latched FATAL
        set_warn();
        assert_eq!(current(), HealthCode::Fatal);

        reset();
        assert_eq!(current(), HealthCode::Ok);
    }

    #[test]
    fn test_display() {
        assert_eq!(HealthCode::Fatal.to_string(), "FATAL");
    }
}
