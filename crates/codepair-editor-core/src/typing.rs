//! Typing presence debouncer.
//!
//! Focus or the first keystroke starts typing; a quiet period without
//! keystrokes, or blur, stops it. Each transition is reported once, so a
//! burst of keystrokes yields one `Started` and one `Stopped`.
//!
//! The debouncer holds no timers. Callers pass `now` and wake at
//! [`TypingDebouncer::deadline`] to call [`TypingDebouncer::poll`].

use std::time::Duration;

use web_time::Instant;

/// Default quiet period before "stopped typing".
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingTransition {
    Started,
    Stopped,
}

impl TypingTransition {
    pub fn is_typing(self) -> bool {
        matches!(self, TypingTransition::Started)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TypingState {
    Idle,
    Typing { last_activity: Instant },
}

#[derive(Clone, Debug)]
pub struct TypingDebouncer {
    quiet_period: Duration,
    state: TypingState,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

impl TypingDebouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: TypingState::Idle,
        }
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.state, TypingState::Typing { .. })
    }

    pub fn focus(&mut self, now: Instant) -> Option<TypingTransition> {
        self.activity(now)
    }

    pub fn keystroke(&mut self, now: Instant) -> Option<TypingTransition> {
        self.activity(now)
    }

    /// Stop immediately.
    pub fn blur(&mut self) -> Option<TypingTransition> {
        match self.state {
            TypingState::Typing { .. } => {
                self.state = TypingState::Idle;
                Some(TypingTransition::Stopped)
            }
            TypingState::Idle => None,
        }
    }

    /// Stop if the quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingTransition> {
        match self.state {
            TypingState::Typing { last_activity }
                if now.saturating_duration_since(last_activity) >= self.quiet_period =>
            {
                self.state = TypingState::Idle;
                Some(TypingTransition::Stopped)
            }
            _ => None,
        }
    }

    /// When `poll` will next report `Stopped`, if typing.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TypingState::Typing { last_activity } => Some(last_activity + self.quiet_period),
            TypingState::Idle => None,
        }
    }

    fn activity(&mut self, now: Instant) -> Option<TypingTransition> {
        let started = !self.is_typing();
        self.state = TypingState::Typing { last_activity: now };
        started.then_some(TypingTransition::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_coalesces() {
        let mut debouncer = TypingDebouncer::default();
        let t0 = Instant::now();
        let mut transitions = Vec::new();

        for i in 0..10 {
            let now = t0 + Duration::from_millis(i * 10);
            transitions.extend(debouncer.keystroke(now));
            transitions.extend(debouncer.poll(now));
        }
        assert_eq!(transitions, vec![TypingTransition::Started]);

        let last = t0 + Duration::from_millis(90);
        assert_eq!(debouncer.deadline(), Some(last + DEFAULT_QUIET_PERIOD));
        assert_eq!(debouncer.poll(last + Duration::from_millis(499)), None);
        assert_eq!(
            debouncer.poll(last + Duration::from_millis(500)),
            Some(TypingTransition::Stopped)
        );
        assert_eq!(debouncer.poll(last + Duration::from_secs(5)), None);
        assert!(!debouncer.is_typing());
    }

    #[test]
    fn test_focus_and_blur() {
        let mut debouncer = TypingDebouncer::default();
        let now = Instant::now();

        assert_eq!(debouncer.blur(), None);
        assert_eq!(debouncer.focus(now), Some(TypingTransition::Started));
        assert_eq!(debouncer.keystroke(now), None);
        assert_eq!(debouncer.blur(), Some(TypingTransition::Stopped));
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.keystroke(now), Some(TypingTransition::Started));
    }
}
