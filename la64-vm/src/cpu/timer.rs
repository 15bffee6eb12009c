//! Constant timer (TCFG/TVAL/TICLR).
//!
//! The stable counter advances with retired instructions, so a run is
//! reproducible: the same program with the same budget sees the same timer
//! interrupts at the same instruction boundaries.

use super::csr::{TCFG_EN, TCFG_PERIODIC, TIMER_BITS};
use crate::bits::mask64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantTimer {
    /// Counter value at which the timer fires; `None` while disarmed.
    deadline: Option<u64>,
    /// Reload value for periodic mode, 0 for one-shot.
    period: u64,
    /// TVAL as last observed when the timer stopped.
    frozen: u64,
}

impl ConstantTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rearm from a TCFG value written at counter value `now`.
    pub fn configure(&mut self, tcfg: u64, now: u64) {
        let init = tcfg & mask64(TIMER_BITS) & !0x3;
        if tcfg & TCFG_EN == 0 {
            self.frozen = self.remaining(now);
            self.deadline = None;
            self.period = 0;
            return;
        }
        self.deadline = Some(now.wrapping_add(init));
        self.period = if tcfg & TCFG_PERIODIC != 0 { init } else { 0 };
        log::trace!(
            "[TIMER] Armed: init={:#x} periodic={} now={}",
            init,
            self.period != 0,
            now
        );
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Live TVAL.
    pub fn remaining(&self, now: u64) -> u64 {
        match self.deadline {
            Some(deadline) => deadline.saturating_sub(now),
            None => self.frozen,
        }
    }

    /// Advance to `now`. Returns true when the timer fired since the last
    /// poll. Periodic timers reload; one-shot timers disarm and the caller
    /// clears TCFG.En.
    pub fn poll(&mut self, now: u64) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }
        if self.period != 0 {
            let overshoot = (now - deadline) % self.period;
            self.deadline = Some(now + self.period - overshoot);
        } else {
            self.deadline = None;
            self.frozen = 0;
        }
        true
    }
}
