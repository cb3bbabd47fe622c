//! Adaptive single-shot silence timer.
//!
//! Converts "no new interim transcript for Δ ms" into an end-of-turn
//! signal, with a feedback loop that widens or tightens the debounce
//! window based on the turn cancellation rate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type SilenceCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Single-shot adaptive silence timer.
pub struct SilenceTimer {
    on_silence_complete: SilenceCallback,
    current_debounce_ms: u64,
    min_debounce_ms: u64,
    max_debounce_ms: u64,
    task: Option<JoinHandle<()>>,
    running: bool,
}

impl SilenceTimer {
    /// Create a timer with the given bounds and callback.
    pub fn new<F, Fut>(callback: F, initial_debounce_ms: u64, min_ms: u64, max_ms: u64) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on_silence_complete: Arc::new(move || Box::pin(callback())),
            current_debounce_ms: initial_debounce_ms,
            min_debounce_ms: min_ms,
            max_debounce_ms: max_ms,
            task: None,
            running: false,
        }
    }

    /// Start (or restart) the timer. Cancels any in-flight timer first.
    ///
    /// `override_ms`, when given, is used instead of the current adaptive
    /// debounce — e.g. a provider "speech-final" hint forces 100ms.
    pub fn start(&mut self, override_ms: Option<u64>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.running = true;
        let duration_ms = override_ms.unwrap_or(self.current_debounce_ms);
        let callback = self.on_silence_complete.clone();

        debug!(
            "silence timer started: {duration_ms}ms{}",
            if override_ms.is_some() { " (override)" } else { "" }
        );

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;
            debug!("silence period complete - triggering callback");
            callback().await;
        }));
    }

    /// Cancel any pending delivery; no callback fires afterwards.
    pub fn cancel(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("silence timer cancelled");
        }
    }

    /// Whether a timer is currently in flight.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current adaptive debounce, in milliseconds.
    pub fn current_debounce_ms(&self) -> u64 {
        self.current_debounce_ms
    }

    /// Manually set the debounce (e.g. from `update_settings`), clamped to bounds.
    pub fn set_debounce_ms(&mut self, debounce_ms: u64) {
        let old = self.current_debounce_ms;
        self.current_debounce_ms = debounce_ms.clamp(self.min_debounce_ms, self.max_debounce_ms);
        info!("debounce manually set: {old}ms -> {}ms", self.current_debounce_ms);
    }

    /// Adjust the debounce given the session cancellation rate.
    ///
    /// `rate > 0.30` widens by 50ms (clamped to max); `rate < 0.15` tightens
    /// by 25ms (clamped to min); otherwise unchanged.
    pub fn adjust_debounce(&mut self, cancellation_rate: f64) {
        let old = self.current_debounce_ms;
        if cancellation_rate > 0.30 {
            self.current_debounce_ms = (self.current_debounce_ms + 50).min(self.max_debounce_ms);
            info!(
                "cancellation rate {:.1}% > 30% - increasing debounce: {old}ms -> {}ms",
                cancellation_rate * 100.0,
                self.current_debounce_ms
            );
        } else if cancellation_rate < 0.15 {
            self.current_debounce_ms = self.current_debounce_ms.saturating_sub(25).max(self.min_debounce_ms);
            info!(
                "cancellation rate {:.1}% < 15% - decreasing debounce: {old}ms -> {}ms",
                cancellation_rate * 100.0,
                self.current_debounce_ms
            );
        } else {
            debug!("cancellation rate {:.1}% within acceptable range", cancellation_rate * 100.0);
        }
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer(counter: Arc<AtomicUsize>) -> SilenceTimer {
        SilenceTimer::new(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            50,
            50,
            200,
        )
    }

    #[tokio::test]
    async fn fires_after_duration() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = counting_timer(counter.clone());
        timer.start(None);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_suppresses_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = counting_timer(counter.clone());
        timer.start(None);
        timer.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restart_resets_countdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = counting_timer(counter.clone());
        timer.start(None);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        timer.start(None); // restart before the first fires
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn override_ms_used_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = counting_timer(counter.clone());
        timer.start(Some(10));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adjust_widens_on_high_cancellation() {
        let mut timer = counting_timer(Arc::new(AtomicUsize::new(0)));
        timer.adjust_debounce(0.5);
        assert_eq!(timer.current_debounce_ms(), 100);
    }

    #[test]
    fn adjust_tightens_on_low_cancellation() {
        let mut timer = counting_timer(Arc::new(AtomicUsize::new(0)));
        timer.set_debounce_ms(100);
        timer.adjust_debounce(0.05);
        assert_eq!(timer.current_debounce_ms(), 75);
    }

    #[test]
    fn adjust_clamps_to_bounds() {
        let mut timer = counting_timer(Arc::new(AtomicUsize::new(0)));
        for _ in 0..20 {
            timer.adjust_debounce(0.05);
        }
        assert_eq!(timer.current_debounce_ms(), 50);
        for _ in 0..20 {
            timer.adjust_debounce(0.9);
        }
        assert_eq!(timer.current_debounce_ms(), 200);
    }

    #[test]
    fn adjust_idempotent_within_acceptable_band() {
        let mut timer = counting_timer(Arc::new(AtomicUsize::new(0)));
        timer.set_debounce_ms(100);
        timer.adjust_debounce(0.2);
        assert_eq!(timer.current_debounce_ms(), 100);
        timer.adjust_debounce(0.2);
        assert_eq!(timer.current_debounce_ms(), 100);
    }
}
