use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// A one-shot timer that can be stopped and re-armed.
///
/// The timer does not run on its own: the owner awaits [`ResumableTimer::fired`]
/// inside its `select!` loop. A stopped timer never fires.
#[derive(Debug, Clone)]
pub struct ResumableTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl ResumableTimer {
    /// Creates a stopped timer.
    pub fn new(delay: Duration) -> Self {
        Self { delay, deadline: None }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Arms the timer unless it is already running.
    pub fn start(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Arms the timer with a full delay from now, even if it was running.
    pub fn restart(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Resolves when the deadline passes, then leaves the timer stopped.
    ///
    /// Pending forever while the timer is stopped. Cancel safe: dropping the
    /// future before it resolves keeps the timer armed.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending().await,
        }
    }
}
