//! Retry policy and bookkeeping for connect and bond failures.
//!
//! A connect "attempt" spans the whole ladder: BLE connect, service
//! discovery, bonding when required, and the auth/init transactions. A
//! failure at any rung produces a [`ConnectFailEvent`](crate::events::ConnectFailEvent)
//! which the controller turns into one of three decisions: retry on the
//! next tick (once, with the auto-connect flag flipped, after a timeout),
//! retry after an attempt-indexed delay, or give up.
//!
//! The short-term window is silent: nothing is surfaced per attempt. When
//! it drains, the controller either gives up or enters the long-term
//! window, which keeps retrying slowly and surfaces exactly one terminal
//! failure when the whole window expires.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use gattkeeper_types::FailureKind;

use crate::events::ConnectFailEvent;

/// Tunable reconnect behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Length of the silent short-term window.
    pub short_term_timeout: Duration,
    /// Length of the long-term window. The single user-visible failure is
    /// emitted when it expires.
    pub long_term_timeout: Duration,
    /// Whether the long-term window is entered at all once the short-term
    /// window drains.
    pub allow_long_term: bool,
    /// Delay before the first delayed retry.
    pub initial_delay: Duration,
    /// Cap for short-term retry delays.
    pub max_delay_short_term: Duration,
    /// Cap for long-term retry delays.
    pub max_delay_long_term: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to delays.
    pub jitter: bool,
    /// Retry immediately once with the auto-connect flag flipped when an
    /// attempt times out.
    pub retry_flipped_auto_connect_on_timeout: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            short_term_timeout: Duration::from_secs(5),
            long_term_timeout: Duration::from_secs(300),
            allow_long_term: true,
            initial_delay: Duration::from_millis(250),
            max_delay_short_term: Duration::from_secs(2),
            max_delay_long_term: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            retry_flipped_auto_connect_on_timeout: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never reconnects silently: every failure is terminal.
    pub fn give_up_immediately() -> Self {
        ReconnectPolicy {
            short_term_timeout: Duration::ZERO,
            allow_long_term: false,
            retry_flipped_auto_connect_on_timeout: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn short_term_timeout(mut self, timeout: Duration) -> Self {
        self.short_term_timeout = timeout;
        self
    }

    #[must_use]
    pub fn long_term_timeout(mut self, timeout: Duration) -> Self {
        self.long_term_timeout = timeout;
        self
    }

    #[must_use]
    pub fn allow_long_term(mut self, allowed: bool) -> Self {
        self.allow_long_term = allowed;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    #[must_use]
    pub fn retry_flipped_auto_connect_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_flipped_auto_connect_on_timeout = enabled;
        self
    }

    /// The delay before the given 0-based retry attempt, capped per phase.
    pub fn delay_for_attempt(&self, attempt: u32, phase: ReconnectPhase) -> Duration {
        let cap = match phase {
            ReconnectPhase::ShortTerm => self.max_delay_short_term,
            ReconnectPhase::LongTerm => self.max_delay_long_term,
        };
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(cap.as_secs_f64());
        let final_delay = if self.jitter {
            capped * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }
}

/// Which retry window a device is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    ShortTerm,
    LongTerm,
}

/// What to do about a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Re-attempt on the next tick with the given auto-connect flag.
    RetryNow { auto_connect: bool },
    /// Re-attempt after the delay.
    RetryAfter(Duration),
    /// Enter the long-term window, then re-attempt after the delay.
    EnterLongTerm(Duration),
    /// Surface the failure and stop.
    GiveUp,
}

/// Per-device reconnect bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectState {
    /// Current window, if a reconnect is in progress.
    pub phase: Option<ReconnectPhase>,
    /// When the current window opened.
    pub window_started: Option<Instant>,
    /// 1-based attempt counter within the current window.
    pub attempt: u32,
    /// Retries of the current sub-step within one attempt.
    pub substep_retries: u32,
    /// Earliest instant the next attempt may start.
    pub next_attempt_at: Option<Instant>,
    /// Auto-connect flag for the next attempt.
    pub auto_connect: bool,
    /// Whether the one-shot flipped retry was already spent.
    pub flipped_once: bool,
    /// Kind of the most recent failure.
    pub last_failure: Option<FailureKind>,
    /// A connect task for this device is queued or executing.
    pub pending_connect: bool,
}

impl Default for ReconnectState {
    fn default() -> Self {
        ReconnectState {
            phase: None,
            window_started: None,
            attempt: 0,
            substep_retries: 0,
            next_attempt_at: None,
            auto_connect: false,
            flipped_once: false,
            last_failure: None,
            pending_connect: false,
        }
    }
}

impl ReconnectState {
    /// Reset after a fully successful attempt.
    pub fn reset(&mut self) {
        *self = ReconnectState::default();
    }

    /// Open the given window now.
    pub fn open_window(&mut self, phase: ReconnectPhase, now: Instant) {
        self.phase = Some(phase);
        self.window_started = Some(now);
        self.attempt = 0;
        self.substep_retries = 0;
        self.next_attempt_at = None;
    }
}

/// Decide what to do about a failed attempt.
///
/// `phase` is the window the device is currently in; an explicit initial
/// connect that has not yet entered a reconnect window is treated as
/// short-term so its budget and delays apply.
pub(crate) fn decide(
    policy: &ReconnectPolicy,
    state: &ReconnectState,
    fail: &ConnectFailEvent,
    now: Instant,
) -> RetryDecision {
    // One-shot heuristic: a timeout sometimes means the wrong auto-connect
    // mode for this peripheral, so flip it and go again immediately.
    if fail.status == FailureKind::TimedOut
        && policy.retry_flipped_auto_connect_on_timeout
        && !state.flipped_once
    {
        return RetryDecision::RetryNow {
            auto_connect: !fail.auto_connect_used,
        };
    }

    let phase = state.phase.unwrap_or(ReconnectPhase::ShortTerm);
    let window_started = state.window_started.unwrap_or(now);
    let elapsed = now.saturating_duration_since(window_started);

    match phase {
        ReconnectPhase::ShortTerm => {
            if elapsed < policy.short_term_timeout {
                RetryDecision::RetryAfter(
                    policy.delay_for_attempt(state.attempt, ReconnectPhase::ShortTerm),
                )
            } else if policy.allow_long_term {
                RetryDecision::EnterLongTerm(
                    policy.delay_for_attempt(0, ReconnectPhase::LongTerm),
                )
            } else {
                RetryDecision::GiveUp
            }
        }
        ReconnectPhase::LongTerm => {
            if elapsed < policy.long_term_timeout {
                RetryDecision::RetryAfter(
                    policy.delay_for_attempt(state.attempt, ReconnectPhase::LongTerm),
                )
            } else {
                RetryDecision::GiveUp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkeeper_types::{DeviceState, MacAddr};

    fn fail_event(status: FailureKind, auto_connect: bool) -> ConnectFailEvent {
        ConnectFailEvent {
            device: MacAddr::new([0xAA, 0xBB, 0xCC, 0, 1, 2]),
            status,
            gatt_status: None,
            timing: Duration::from_secs(1),
            highest_state_reached: DeviceState::BleConnecting,
            bond_failure_reason: None,
            auto_connect_used: auto_connect,
            txn_failure_reason: None,
            attempt: 1,
        }
    }

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy::default().jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flips_auto_connect_once() {
        let policy = no_jitter();
        let mut state = ReconnectState::default();
        state.open_window(ReconnectPhase::ShortTerm, Instant::now());

        let decision = decide(&policy, &state, &fail_event(FailureKind::TimedOut, false), Instant::now());
        assert_eq!(decision, RetryDecision::RetryNow { auto_connect: true });

        state.flipped_once = true;
        let decision = decide(&policy, &state, &fail_event(FailureKind::TimedOut, true), Instant::now());
        assert!(matches!(decision, RetryDecision::RetryAfter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_term_window_then_long_term() {
        let policy = no_jitter();
        let mut state = ReconnectState::default();
        let start = Instant::now();
        state.open_window(ReconnectPhase::ShortTerm, start);
        state.flipped_once = true;

        let fail = fail_event(FailureKind::RogueDisconnect, false);
        assert!(matches!(
            decide(&policy, &state, &fail, start + Duration::from_secs(2)),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            decide(&policy, &state, &fail, start + Duration::from_secs(6)),
            RetryDecision::EnterLongTerm(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_term_gives_up_when_long_term_disallowed() {
        let policy = no_jitter().allow_long_term(false);
        let mut state = ReconnectState::default();
        let start = Instant::now();
        state.open_window(ReconnectPhase::ShortTerm, start);

        let fail = fail_event(FailureKind::RogueDisconnect, false);
        assert_eq!(
            decide(&policy, &state, &fail, start + Duration::from_secs(6)),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_term_expires() {
        let policy = no_jitter();
        let mut state = ReconnectState::default();
        let start = Instant::now();
        state.open_window(ReconnectPhase::LongTerm, start);

        let fail = fail_event(FailureKind::RogueDisconnect, false);
        assert!(matches!(
            decide(&policy, &state, &fail, start + Duration::from_secs(100)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            decide(&policy, &state, &fail, start + Duration::from_secs(301)),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_delay_backoff_and_caps() {
        let policy = no_jitter();
        assert_eq!(
            policy.delay_for_attempt(0, ReconnectPhase::ShortTerm),
            Duration::from_millis(250)
        );
        assert_eq!(
            policy.delay_for_attempt(1, ReconnectPhase::ShortTerm),
            Duration::from_millis(500)
        );
        // 250ms * 2^6 = 16s, capped at 2s short-term, 16s < 30s long-term.
        assert_eq!(
            policy.delay_for_attempt(6, ReconnectPhase::ShortTerm),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for_attempt(6, ReconnectPhase::LongTerm),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = ReconnectPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0, ReconnectPhase::ShortTerm);
            assert!(d >= Duration::from_millis(250));
            assert!(d <= Duration::from_millis(313));
        }
    }
}
