use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Sliding count of requests issued within the trailing window.
///
/// Independent of the rate limiter's bucket; used for logging and status only.
#[derive(Debug)]
pub struct RequestWindow {
    span: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl Default for RequestWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RequestWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        stamps.push_back(now);
        prune(&mut stamps, now, self.span);
    }

    pub fn count(&self) -> usize {
        let now = Instant::now();
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut stamps, now, self.span);
        stamps.len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = stamps.front() {
        if now.saturating_duration_since(*front) > span {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
