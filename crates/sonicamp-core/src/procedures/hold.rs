//! Cancellable hold

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::HoldDuration;
use crate::device::DeviceError;

/// Waits for a duration unless cancelled first
#[derive(Debug)]
pub struct Hold {
    duration: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Hold {
    /// Hold for `duration`
    pub fn new(duration: HoldDuration) -> Self {
        Self {
            duration: duration.to_duration(),
            deadline: Mutex::new(None),
        }
    }

    /// Total length of the hold
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time left; the full duration before the hold started
    pub fn remaining_time(&self) -> Duration {
        match *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.duration,
        }
    }

    /// Wait out the duration, or until `cancel` fires
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.duration;
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
        tokio::select! {
            _ = cancel.cancelled() => Err(DeviceError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }
}

/// Hold for `duration`
pub async fn hold(duration: HoldDuration, cancel: &CancellationToken) -> Result<(), DeviceError> {
    Hold::new(duration).execute(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hold_waits_full_duration() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let hold = Hold::new(HoldDuration::s(2.0));
        assert_eq!(hold.remaining_time(), Duration::from_secs(2));
        hold.execute(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(hold.remaining_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_is_cancellable() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result = hold(HoldDuration::s(60.0), &cancel).await;
        assert!(matches!(result, Err(DeviceError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
