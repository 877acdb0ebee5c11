//! Timer handles on top of the tokio reactor.
//!
//! A [`Timer`] owns its scheduled callback: calling [`Timer::disable`],
//! dropping the handle, or overwriting the field it lives in cancels the
//! timer before it can fire. The cancellation check happens on the reactor
//! before the callback runs, so a timer disabled from another callback never
//! fires afterwards.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
}

impl Timer {
    /// A handle with nothing scheduled, for struct initialisation.
    pub fn disabled() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Timer { token }
    }

    /// Runs `callback` once after `delay`, unless cancelled first.
    pub fn once<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            // Biased so cancellation always wins over an elapsed deadline.
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => callback(),
            }
        });
        Timer { token }
    }

    /// Runs `callback` every `period` until cancelled. The first run happens
    /// one full period after scheduling.
    pub fn repeating<F>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = guard.cancelled() => break,
                    _ = tokio::time::sleep(period) => callback(),
                }
            }
        });
        Timer { token }
    }

    pub fn disable(&self) {
        self.token.cancel();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
