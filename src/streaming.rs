//! Simulated streaming: reveal an already-received answer a few characters
//! at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Pace of the reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevealConfig {
    pub chars_per_tick: usize,
    pub tick_ms: u64,
}

impl Default for RevealConfig {
    fn default() -> Self {
        Self {
            chars_per_tick: 3,
            tick_ms: 30,
        }
    }
}

impl RevealConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Stepper over a string that exposes a growing prefix on char boundaries.
#[derive(Debug, Clone)]
pub struct Reveal {
    text: String,
    /// Byte offset of the end of the visible prefix.
    shown: usize,
    step: usize,
}

impl Reveal {
    pub fn new(text: impl Into<String>, chars_per_tick: usize) -> Self {
        Self {
            text: text.into(),
            shown: 0,
            step: chars_per_tick.max(1),
        }
    }

    pub fn visible(&self) -> &str {
        &self.text[..self.shown]
    }

    pub fn is_complete(&self) -> bool {
        self.shown >= self.text.len()
    }

    /// Number of characters currently visible.
    pub fn shown_chars(&self) -> usize {
        self.visible().chars().count()
    }

    /// Show the next `chars_per_tick` characters and return the visible prefix.
    /// Returns `None` once the whole text is visible.
    pub fn advance(&mut self) -> Option<&str> {
        if self.is_complete() {
            return None;
        }
        let rest = &self.text[self.shown..];
        let offset = rest
            .char_indices()
            .nth(self.step)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.shown += offset;
        Some(self.visible())
    }
}

/// Sender half of a stop signal. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiver half of a stop signal, polled by [`reveal`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Create a fresh, un-triggered stop signal.
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arm the signal for the next reveal.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is triggered. Never resolves if every
    /// [`StopHandle`] has been dropped without stopping.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealOutcome {
    /// Every character was shown; the last frame was the full text.
    Completed,
    /// Stopped early with `shown` characters visible.
    Cancelled { shown: usize },
}

/// Drive a [`Reveal`] on a timer, calling `on_frame` with each visible prefix.
///
/// For non-empty text the full text reaches `on_frame` exactly once, as the
/// final frame of a completed reveal. A stop that arrives first ends the
/// reveal without it. Empty text completes at once with no frames.
pub async fn reveal<F>(text: &str, cfg: RevealConfig, mut signal: StopSignal, mut on_frame: F) -> RevealOutcome
where
    F: FnMut(&str),
{
    let mut stepper = Reveal::new(text, cfg.chars_per_tick);
    if stepper.is_complete() {
        return RevealOutcome::Completed;
    }

    let mut ticker = tokio::time::interval(cfg.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if signal.is_stopped() {
            return RevealOutcome::Cancelled {
                shown: stepper.shown_chars(),
            };
        }
        tokio::select! {
            biased;
            _ = signal.stopped() => {
                return RevealOutcome::Cancelled { shown: stepper.shown_chars() };
            }
            _ = ticker.tick() => {
                match stepper.advance() {
                    Some(frame) => on_frame(frame),
                    None => return RevealOutcome::Completed,
                }
                if stepper.is_complete() {
                    return RevealOutcome::Completed;
                }
            }
        }
    }
}
