use std::time::Duration;

use shared::{domain::UserId, protocol::SenderSummary};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Typing,
}

/// Outbound typing notification to write to the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub display_name: String,
}

/// Debounces local keystrokes into start/stop signals and tracks which remote
/// participant, if any, is shown as typing.
///
/// The coordinator never owns a timer. It exposes the inactivity deadline and
/// expects the owner to call [`TypingCoordinator::on_timer`] once it passes.
#[derive(Debug)]
pub struct TypingCoordinator {
    local_user: UserId,
    timeout: Duration,
    push_enabled: bool,
    state: TypingState,
    deadline: Option<Instant>,
    indicator: Option<TypingIndicator>,
}

impl TypingCoordinator {
    pub fn new(local_user: UserId, timeout: Duration) -> Self {
        Self {
            local_user,
            timeout,
            push_enabled: false,
            state: TypingState::Idle,
            deadline: None,
            indicator: None,
        }
    }

    pub fn state(&self) -> TypingState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn indicator(&self) -> Option<&TypingIndicator> {
        self.indicator.as_ref()
    }

    /// Without a push channel there is nowhere cheap to send signals, so local
    /// input stops being tracked at all.
    pub fn set_push_enabled(&mut self, enabled: bool) {
        self.push_enabled = enabled;
        if !enabled {
            self.state = TypingState::Idle;
            self.deadline = None;
        }
    }

    pub fn on_user_input(&mut self, now: Instant) -> Option<TypingSignal> {
        if !self.push_enabled {
            return None;
        }
        self.deadline = Some(now + self.timeout);
        if self.state == TypingState::Idle {
            self.state = TypingState::Typing;
            return Some(TypingSignal::Start);
        }
        None
    }

    pub fn on_timer(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.go_idle()
            }
            _ => None,
        }
    }

    pub fn on_send(&mut self) -> Option<TypingSignal> {
        self.deadline = None;
        self.go_idle()
    }

    /// Returns whether the displayed indicator changed.
    pub fn on_remote_typing(&mut self, user: &SenderSummary, is_typing: bool) -> bool {
        if user.id == self.local_user {
            return false;
        }
        let next = if is_typing {
            Some(TypingIndicator {
                user_id: user.id.clone(),
                display_name: user.display_name().to_string(),
            })
        } else {
            match &self.indicator {
                Some(current) if current.user_id == user.id => None,
                _ => return false,
            }
        };
        if next == self.indicator {
            return false;
        }
        self.indicator = next;
        true
    }

    fn go_idle(&mut self) -> Option<TypingSignal> {
        if self.state == TypingState::Typing {
            self.state = TypingState::Idle;
            return Some(TypingSignal::Stop);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn sender(id: &str, first_name: &str) -> SenderSummary {
        SenderSummary {
            id: UserId::from(id),
            username: format!("{id}-login"),
            first_name: Some(first_name.to_string()),
            last_name: None,
            profile_picture: None,
        }
    }

    fn push_coordinator() -> TypingCoordinator {
        let mut coordinator = TypingCoordinator::new(UserId::from("me"), TIMEOUT);
        coordinator.set_push_enabled(true);
        coordinator
    }

    #[test]
    fn first_keystroke_starts_and_later_ones_only_extend_the_deadline() {
        let mut coordinator = push_coordinator();
        let t0 = Instant::now();

        assert_eq!(coordinator.on_user_input(t0), Some(TypingSignal::Start));
        assert_eq!(
            coordinator.on_user_input(t0 + Duration::from_secs(2)),
            None
        );
        assert_eq!(
            coordinator.deadline(),
            Some(t0 + Duration::from_secs(2) + TIMEOUT)
        );

        assert_eq!(coordinator.on_timer(t0 + TIMEOUT), None);
        assert_eq!(coordinator.state(), TypingState::Typing);
        assert_eq!(
            coordinator.on_timer(t0 + Duration::from_secs(5)),
            Some(TypingSignal::Stop)
        );
        assert_eq!(coordinator.state(), TypingState::Idle);
        assert!(coordinator.deadline().is_none());
    }

    #[test]
    fn explicit_send_stops_typing_once() {
        let mut coordinator = push_coordinator();
        coordinator.on_user_input(Instant::now());
        assert_eq!(coordinator.on_send(), Some(TypingSignal::Stop));
        assert_eq!(coordinator.on_send(), None);
    }

    #[test]
    fn poll_mode_never_emits_signals() {
        let mut coordinator = TypingCoordinator::new(UserId::from("me"), TIMEOUT);
        assert_eq!(coordinator.on_user_input(Instant::now()), None);
        assert!(coordinator.deadline().is_none());
        assert_eq!(coordinator.on_send(), None);
    }

    #[test]
    fn remote_indicator_ignores_self_and_replaces_previous_user() {
        let mut coordinator = TypingCoordinator::new(UserId::from("me"), TIMEOUT);

        assert!(!coordinator.on_remote_typing(&sender("me", "Me"), true));
        assert!(coordinator.indicator().is_none());

        assert!(coordinator.on_remote_typing(&sender("u1", "Alice"), true));
        assert!(coordinator.on_remote_typing(&sender("u2", "Bob"), true));
        assert_eq!(
            coordinator.indicator().map(|i| i.display_name.as_str()),
            Some("Bob")
        );

        assert!(!coordinator.on_remote_typing(&sender("u1", "Alice"), false));
        assert!(coordinator.on_remote_typing(&sender("u2", "Bob"), false));
        assert!(coordinator.indicator().is_none());
    }
}
