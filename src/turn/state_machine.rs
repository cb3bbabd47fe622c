//! Deterministic turn state machine.
//!
//! Enforces the five-state turn lifecycle and the legal transition graph.
//! This is the project's safety contract: an agent utterance is only
//! audible after IDLE → LISTENING → SPECULATIVE → COMMITTED → SPEAKING has
//! been travelled, i.e. after both a silence confirmation and a
//! first-sentence commitment.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Voice agent turn states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TurnState {
    /// No activity, waiting for user input.
    Idle,
    /// Receiving user audio, transcribing.
    Listening,
    /// Silence detected, generation may start; output hidden.
    Speculative,
    /// User intent confirmed; generated output may surface.
    Committed,
    /// Agent is speaking; interruptible.
    Speaking,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Listening => "LISTENING",
            Self::Speculative => "SPECULATIVE",
            Self::Committed => "COMMITTED",
            Self::Speaking => "SPEAKING",
        };
        f.write_str(s)
    }
}

/// A single recorded state transition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransitionRecord {
    /// State transitioned from (`None` for the initial record).
    pub from: Option<TurnState>,
    /// State transitioned to.
    pub to: TurnState,
    /// Human-readable reason, for logging and telemetry.
    pub reason: String,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
}

fn allowed_transitions(state: TurnState) -> &'static HashSet<TurnState> {
    static TABLE: OnceLock<[HashSet<TurnState>; 5]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        use TurnState::*;
        [
            HashSet::from([Listening]),                    // Idle
            HashSet::from([Speculative, Idle]),             // Listening
            HashSet::from([Committed, Listening, Idle]),    // Speculative
            HashSet::from([Speaking, Idle]),                // Committed
            HashSet::from([Idle, Listening]),               // Speaking
        ]
    });
    let idx = match state {
        TurnState::Idle => 0,
        TurnState::Listening => 1,
        TurnState::Speculative => 2,
        TurnState::Committed => 3,
        TurnState::Speaking => 4,
    };
    &table[idx]
}

type AsyncHook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type AsyncTransitionHook =
    Box<dyn Fn(TurnState, TurnState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Deterministic state machine for turn control.
///
/// Mutated only by the owning Controller task — never call `transition`
/// concurrently from more than one task.
pub struct StateMachine {
    current: TurnState,
    previous: Option<TurnState>,
    history: Vec<TransitionRecord>,
    on_enter: std::collections::HashMap<TurnState, Vec<AsyncHook>>,
    on_exit: std::collections::HashMap<TurnState, Vec<AsyncHook>>,
    on_transition: Vec<AsyncTransitionHook>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("previous", &self.previous)
            .finish()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl StateMachine {
    /// Create a new state machine, starting in `IDLE`.
    pub fn new() -> Self {
        let mut sm = Self {
            current: TurnState::Idle,
            previous: None,
            history: Vec::new(),
            on_enter: std::collections::HashMap::new(),
            on_exit: std::collections::HashMap::new(),
            on_transition: Vec::new(),
        };
        info!("state machine initialized in state: IDLE");
        sm.record(None, TurnState::Idle, "initialization");
        sm
    }

    /// Current state.
    pub fn current(&self) -> TurnState {
        self.current
    }

    /// Previous state, if any transition has occurred.
    pub fn previous(&self) -> Option<TurnState> {
        self.previous
    }

    /// Immutable view of the trajectory so far.
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Whether `to` is reachable from the current state.
    pub fn can_transition(&self, to: TurnState) -> bool {
        let allowed = allowed_transitions(self.current).contains(&to);
        if !allowed {
            warn!("invalid transition attempted: {} -> {to}", self.current);
        }
        allowed
    }

    /// Attempt a transition, running exit/enter/any-transition hooks.
    ///
    /// Returns `false` (never panics or raises) if the transition is not
    /// allowed from the current state — callers must check the result.
    pub async fn transition(&mut self, to: TurnState, reason: &str) -> bool {
        if !self.can_transition(to) {
            error!(
                "invalid state transition: {} -> {to}. allowed: {:?}",
                self.current,
                allowed_transitions(self.current)
            );
            return false;
        }

        let from = self.current;
        self.run_exit_hooks(from).await;

        self.previous = Some(from);
        self.current = to;
        self.record(Some(from), to, reason);

        if reason.is_empty() {
            info!("state transition: {from} -> {to}");
        } else {
            info!("state transition: {from} -> {to} (reason: {reason})");
        }

        self.run_enter_hooks(to).await;
        self.run_transition_hooks(from, to).await;
        true
    }

    /// Register a callback invoked when entering `state`.
    pub fn on_enter<F, Fut>(&mut self, state: TurnState, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_enter
            .entry(state)
            .or_default()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Register a callback invoked when exiting `state`.
    pub fn on_exit<F, Fut>(&mut self, state: TurnState, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_exit
            .entry(state)
            .or_default()
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Register a callback invoked on every transition, receiving (from, to).
    pub fn on_any_transition<F, Fut>(&mut self, callback: F)
    where
        F: Fn(TurnState, TurnState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_transition
            .push(Box::new(move |f, t| Box::pin(callback(f, t))));
    }

    /// Reset unconditionally to `IDLE`.
    pub async fn reset(&mut self) {
        info!("resetting state machine to IDLE");
        self.transition(TurnState::Idle, "reset").await;
    }

    /// All states reachable from the current one.
    pub fn allowed_transitions(&self) -> HashSet<TurnState> {
        allowed_transitions(self.current).clone()
    }

    fn record(&mut self, from: Option<TurnState>, to: TurnState, reason: &str) {
        self.history.push(TransitionRecord {
            from,
            to,
            reason: reason.to_owned(),
            timestamp_ms: now_ms(),
        });
    }

    async fn run_enter_hooks(&self, state: TurnState) {
        if let Some(hooks) = self.on_enter.get(&state) {
            for hook in hooks {
                hook().await;
            }
        }
    }

    async fn run_exit_hooks(&self, state: TurnState) {
        if let Some(hooks) = self.on_exit.get(&state) {
            for hook in hooks {
                hook().await;
            }
        }
    }

    async fn run_transition_hooks(&self, from: TurnState, to: TurnState) {
        for hook in &self.on_transition {
            hook(from, to).await;
        }
        debug!("ran {} transition hooks", self.on_transition.len());
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_idle() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), TurnState::Idle);
        assert_eq!(sm.history().len(), 1);
    }

    #[tokio::test]
    async fn legal_transition_succeeds() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(TurnState::Listening, "first audio").await);
        assert_eq!(sm.current(), TurnState::Listening);
        assert_eq!(sm.previous(), Some(TurnState::Idle));
    }

    #[tokio::test]
    async fn illegal_transition_rejected_not_fatal() {
        let mut sm = StateMachine::new();
        assert!(!sm.transition(TurnState::Speaking, "bogus").await);
        assert_eq!(sm.current(), TurnState::Idle);
    }

    #[tokio::test]
    async fn full_happy_path() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(TurnState::Listening, "").await);
        assert!(sm.transition(TurnState::Speculative, "").await);
        assert!(sm.transition(TurnState::Committed, "").await);
        assert!(sm.transition(TurnState::Speaking, "").await);
        assert!(sm.transition(TurnState::Idle, "").await);
        assert_eq!(sm.history().len(), 6);
        for record in sm.history().iter().skip(1) {
            let from = record.from.expect("non-initial record has a from state");
            assert!(allowed_transitions(from).contains(&record.to));
        }
    }

    #[tokio::test]
    async fn barge_in_from_speaking() {
        let mut sm = StateMachine::new();
        sm.transition(TurnState::Listening, "").await;
        sm.transition(TurnState::Speculative, "").await;
        sm.transition(TurnState::Committed, "").await;
        sm.transition(TurnState::Speaking, "").await;
        assert!(sm.transition(TurnState::Listening, "barge-in").await);
    }

    #[tokio::test]
    async fn hooks_fire_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let order = Arc::new(AtomicUsize::new(0));
        let mut sm = StateMachine::new();

        let exit_order = order.clone();
        sm.on_exit(TurnState::Idle, move || {
            let o = exit_order.clone();
            async move {
                o.fetch_add(1, Ordering::SeqCst);
            }
        });

        let enter_order = order.clone();
        sm.on_enter(TurnState::Listening, move || {
            let o = enter_order.clone();
            async move {
                assert_eq!(o.fetch_add(1, Ordering::SeqCst), 1);
            }
        });

        sm.transition(TurnState::Listening, "").await;
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
