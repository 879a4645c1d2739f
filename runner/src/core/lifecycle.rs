//! Forward-only state machine of an isolated context.
//!
//! `Created → Loaded → Invoked → Destroyed`. Destruction is allowed from any
//! live state; nothing is allowed after it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Loaded,
    Invoked,
    Destroyed,
}

/// Operations a caller may attempt on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Load,
    Send,
    Invoke,
    Receive,
    Destroy,
}

impl ContextState {
    pub fn permits(self, action: Action) -> bool {
        match (self, action) {
            (ContextState::Destroyed, _) => false,
            (_, Action::Destroy) => true,
            (ContextState::Created, Action::Load) => true,
            (ContextState::Loaded, Action::Send | Action::Invoke) => true,
            (ContextState::Invoked, Action::Receive) => true,
            _ => false,
        }
    }

    /// State after `action` succeeds. Only meaningful when `permits` holds.
    pub fn after(self, action: Action) -> ContextState {
        match action {
            Action::Load => ContextState::Loaded,
            Action::Invoke => ContextState::Invoked,
            Action::Destroy => ContextState::Destroyed,
            Action::Send | Action::Receive => self,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Created => "created",
            ContextState::Loaded => "loaded",
            ContextState::Invoked => "invoked",
            ContextState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Load => "load",
            Action::Send => "send",
            Action::Invoke => "invoke",
            Action::Receive => "receive",
            Action::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_moves_forward() {
        let mut state = ContextState::Created;
        for action in [
            Action::Load,
            Action::Send,
            Action::Invoke,
            Action::Receive,
            Action::Destroy,
        ] {
            assert!(state.permits(action), "{state} should permit {action}");
            state = state.after(action);
        }
        assert_eq!(state, ContextState::Destroyed);
    }

    #[test]
    fn no_going_back() {
        assert!(!ContextState::Loaded.permits(Action::Load));
        assert!(!ContextState::Invoked.permits(Action::Invoke));
        assert!(!ContextState::Invoked.permits(Action::Send));
        assert!(!ContextState::Created.permits(Action::Invoke));
    }

    #[test]
    fn destroyed_is_terminal() {
        for action in [
            Action::Load,
            Action::Send,
            Action::Invoke,
            Action::Receive,
            Action::Destroy,
        ] {
            assert!(!ContextState::Destroyed.permits(action));
        }
    }

    #[test]
    fn unloaded_context_can_still_be_destroyed() {
        assert!(ContextState::Created.permits(Action::Destroy));
    }
}
