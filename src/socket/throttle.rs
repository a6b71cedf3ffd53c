use std::time::Duration;

use tokio::time::Instant;

/// Leading and trailing edge throttle for reconnect attempts.
///
/// The first request in a window fires at once; further requests inside the
/// window collapse into one trailing attempt at the window's end.
#[derive(Debug)]
pub struct ReconnectThrottle {
    wait: Duration,
    last_fired: Option<Instant>,
    trailing: bool,
}

impl ReconnectThrottle {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            last_fired: None,
            trailing: false,
        }
    }

    /// Returns true when the caller should reconnect now.
    pub fn request(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(at) if now < at + self.wait => {
                self.trailing = true;
                false
            }
            _ => {
                self.last_fired = Some(now);
                self.trailing = false;
                true
            }
        }
    }

    pub fn trailing_deadline(&self) -> Option<Instant> {
        if !self.trailing {
            return None;
        }
        self.last_fired.map(|at| at + self.wait)
    }

    /// Fires the pending trailing attempt if its deadline has passed.
    pub fn take_trailing(&mut self, now: Instant) -> bool {
        match self.trailing_deadline() {
            Some(deadline) if deadline <= now => {
                self.trailing = false;
                self.last_fired = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.trailing = false;
    }
}

#[cfg(test)]
#[path = "tests/throttle_tests.rs"]
mod tests;
