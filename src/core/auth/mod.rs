//! Authentication state machine.
//!
//! Consumes key events, timer expirations, and verifier verdicts; owns the
//! secure credential buffer and the failed-attempt counter. Every transition
//! performs exactly one buffer/verifier side effect, so "buffer is
//! non-empty" and "state" agree at every observation point, and the state
//! after any event sequence is a pure function of that sequence.
//!
//! The machine itself performs no I/O: it returns [`AuthAction`]s for the
//! runtime to interpret (hand the buffer to the verifier, reschedule
//! timers, unlock). This keeps the whole thing replayable in tests with a
//! stubbed verifier.

pub mod password;
pub mod verifier;

use xkbcommon::xkb::Keysym;

pub use password::Password;
pub use verifier::{Verdict, Verifier};

/// Indicator-visible authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Idle,
    /// Buffer was explicitly cleared.
    Clear,
    /// A codepoint was just appended.
    Input,
    /// A no-op keypress (backspace on an empty buffer).
    InputNop,
    /// The last character was just removed.
    Backspace,
    /// Credential handed to the verifier; waiting for the verdict.
    Validating,
    /// The last attempt was rejected.
    Invalid,
}

/// One input to the machine.
#[derive(Debug)]
pub enum AuthEvent {
    Key {
        keysym: Keysym,
        codepoint: Option<char>,
        ctrl: bool,
    },
    Verdict(Verdict),
    /// The short indicator-clear timer fired.
    IndicatorClearElapsed,
    /// The long password-clear timer fired.
    PasswordClearElapsed,
}

/// Side effects the runtime must carry out for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Hand the buffer contents to the verifier.
    Submit,
    /// Verification succeeded: begin unlock/teardown.
    Unlock,
    /// (Re)arm the indicator-clear timer.
    ScheduleIndicatorClear,
    /// (Re)arm the password-clear timer. Reset on every keystroke, not
    /// only on state transitions into `Input`.
    SchedulePasswordClear,
    /// The indicator needs repainting.
    Redraw,
}

/// The authentication state machine.
#[derive(Debug, Default)]
pub struct Auth {
    pub state: AuthState,
    pub password: Password,
    pub failed_attempts: u32,
    /// Ignore submit when the buffer is empty (`--ignore-empty-password`).
    pub ignore_empty: bool,
}

impl Auth {
    pub fn new(ignore_empty: bool) -> Self {
        Self {
            state: AuthState::Idle,
            password: Password::new(),
            failed_attempts: 0,
            ignore_empty,
        }
    }

    /// Feed one event through the machine.
    pub fn handle(&mut self, event: AuthEvent) -> Vec<AuthAction> {
        match event {
            AuthEvent::Key {
                keysym,
                codepoint,
                ctrl,
            } => self.handle_key(keysym, codepoint, ctrl),
            AuthEvent::Verdict(verdict) => self.handle_verdict(verdict),
            AuthEvent::IndicatorClearElapsed => self.handle_indicator_clear(),
            AuthEvent::PasswordClearElapsed => self.handle_password_clear(),
        }
    }

    fn handle_key(&mut self, keysym: Keysym, codepoint: Option<char>, ctrl: bool) -> Vec<AuthAction> {
        // A submit answer is pending; nothing else may touch the buffer.
        if self.state == AuthState::Validating {
            return Vec::new();
        }

        match keysym {
            Keysym::Return | Keysym::KP_Enter => {
                if self.password.is_empty() && self.ignore_empty {
                    return Vec::new();
                }
                if self.password.is_empty() {
                    // Nothing to validate; show the same feedback as a
                    // backspace on an empty buffer.
                    self.state = AuthState::InputNop;
                    return vec![AuthAction::ScheduleIndicatorClear, AuthAction::Redraw];
                }
                self.state = AuthState::Validating;
                // The buffer is intentionally not cleared here: it is erased
                // only once the verifier answers, so an interrupted attempt
                // loses nothing.
                vec![AuthAction::Submit, AuthAction::Redraw]
            }
            Keysym::BackSpace => {
                if self.password.pop() {
                    self.state = AuthState::Backspace;
                } else {
                    self.state = AuthState::InputNop;
                }
                vec![
                    AuthAction::ScheduleIndicatorClear,
                    AuthAction::SchedulePasswordClear,
                    AuthAction::Redraw,
                ]
            }
            Keysym::Escape => self.clear_buffer(),
            _ if ctrl && keysym == Keysym::u => self.clear_buffer(),
            _ => match codepoint {
                Some(ch) if !ch.is_control() => {
                    if self.password.push(ch) {
                        self.state = AuthState::Input;
                    }
                    // On allocation failure the keystroke is dropped and the
                    // state is left as-is; no corrupt buffer either way.
                    vec![
                        AuthAction::ScheduleIndicatorClear,
                        AuthAction::SchedulePasswordClear,
                        AuthAction::Redraw,
                    ]
                }
                _ => Vec::new(),
            },
        }
    }

    fn clear_buffer(&mut self) -> Vec<AuthAction> {
        self.password.clear();
        self.state = AuthState::Clear;
        vec![AuthAction::ScheduleIndicatorClear, AuthAction::Redraw]
    }

    fn handle_verdict(&mut self, verdict: Verdict) -> Vec<AuthAction> {
        if self.state != AuthState::Validating {
            // A verdict with no outstanding submit (for example after the
            // helper died mid-session) has nothing to decide.
            return Vec::new();
        }
        match verdict {
            Verdict::Accepted => {
                self.password.clear();
                vec![AuthAction::Unlock]
            }
            Verdict::Rejected | Verdict::Unavailable => {
                if verdict == Verdict::Unavailable {
                    tracing::warn!("verifier unavailable; treating as rejected");
                }
                self.failed_attempts += 1;
                self.password.clear();
                self.state = AuthState::Invalid;
                vec![
                    AuthAction::ScheduleIndicatorClear,
                    AuthAction::SchedulePasswordClear,
                    AuthAction::Redraw,
                ]
            }
        }
    }

    fn handle_indicator_clear(&mut self) -> Vec<AuthAction> {
        match self.state {
            AuthState::Invalid | AuthState::Clear | AuthState::Backspace | AuthState::InputNop => {
                self.state = AuthState::Idle;
                vec![AuthAction::Redraw]
            }
            _ => Vec::new(),
        }
    }

    fn handle_password_clear(&mut self) -> Vec<AuthAction> {
        // Fires regardless of state, except while the buffer is on loan
        // to the verifier: a submit processed earlier in the same loop
        // iteration always wins over this timer.
        if self.state == AuthState::Validating {
            return Vec::new();
        }
        self.password.clear();
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(auth: &mut Auth, ch: char) -> Vec<AuthAction> {
        // The keysym only matters for the special keys; any letter keysym
        // stands in for printable input.
        auth.handle(AuthEvent::Key {
            keysym: Keysym::a,
            codepoint: Some(ch),
            ctrl: false,
        })
    }

    fn special(auth: &mut Auth, keysym: Keysym) -> Vec<AuthAction> {
        auth.handle(AuthEvent::Key {
            keysym,
            codepoint: None,
            ctrl: false,
        })
    }

    #[test]
    fn test_typing_enters_input_state() {
        let mut auth = Auth::new(false);
        let actions = key(&mut auth, 'a');
        assert_eq!(auth.state, AuthState::Input);
        assert_eq!(auth.password.len(), 1);
        assert!(actions.contains(&AuthAction::SchedulePasswordClear));
    }

    #[test]
    fn test_rejected_attempt_full_sequence() {
        // "a", "b", backspace, submit; verifier rejects.
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        key(&mut auth, 'b');
        special(&mut auth, Keysym::BackSpace);
        assert_eq!(auth.state, AuthState::Backspace);
        assert_eq!(auth.password.as_str(), "a");

        let actions = special(&mut auth, Keysym::Return);
        assert_eq!(auth.state, AuthState::Validating);
        assert!(actions.contains(&AuthAction::Submit));

        auth.handle(AuthEvent::Verdict(Verdict::Rejected));
        assert_eq!(auth.state, AuthState::Invalid);
        assert_eq!(auth.password.len(), 0);
        assert_eq!(auth.failed_attempts, 1);
    }

    #[test]
    fn test_empty_submit_never_validates() {
        let mut auth = Auth::new(false);
        let actions = special(&mut auth, Keysym::Return);
        assert_ne!(auth.state, AuthState::Validating);
        assert!(!actions.contains(&AuthAction::Submit));

        let mut ignoring = Auth::new(true);
        let actions = special(&mut ignoring, Keysym::Return);
        assert_eq!(ignoring.state, AuthState::Idle);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_backspace_on_empty_is_nop_state() {
        let mut auth = Auth::new(false);
        special(&mut auth, Keysym::BackSpace);
        assert_eq!(auth.state, AuthState::InputNop);
        assert_eq!(auth.password.len(), 0);
    }

    #[test]
    fn test_escape_clears() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        special(&mut auth, Keysym::Escape);
        assert_eq!(auth.state, AuthState::Clear);
        assert!(auth.password.is_empty());
    }

    #[test]
    fn test_ctrl_u_clears() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        auth.handle(AuthEvent::Key {
            keysym: Keysym::u,
            codepoint: Some('u'),
            ctrl: true,
        });
        assert_eq!(auth.state, AuthState::Clear);
        assert!(auth.password.is_empty());
    }

    #[test]
    fn test_submit_while_validating_ignored() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        special(&mut auth, Keysym::Return);
        assert_eq!(auth.state, AuthState::Validating);

        let actions = special(&mut auth, Keysym::Return);
        assert!(actions.is_empty());
        let actions = key(&mut auth, 'b');
        assert!(actions.is_empty());
        assert_eq!(auth.password.as_str(), "a");
    }

    #[test]
    fn test_accepted_unlocks_and_clears() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        special(&mut auth, Keysym::Return);
        let actions = auth.handle(AuthEvent::Verdict(Verdict::Accepted));
        assert_eq!(actions, vec![AuthAction::Unlock]);
        assert!(auth.password.is_empty());
    }

    #[test]
    fn test_unavailable_counts_as_rejected() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        special(&mut auth, Keysym::Return);
        auth.handle(AuthEvent::Verdict(Verdict::Unavailable));
        assert_eq!(auth.state, AuthState::Invalid);
        assert_eq!(auth.failed_attempts, 1);
    }

    #[test]
    fn test_indicator_clear_only_from_transient_states() {
        let mut auth = Auth::new(false);
        special(&mut auth, Keysym::BackSpace);
        auth.handle(AuthEvent::IndicatorClearElapsed);
        assert_eq!(auth.state, AuthState::Idle);

        key(&mut auth, 'a');
        auth.handle(AuthEvent::IndicatorClearElapsed);
        assert_eq!(auth.state, AuthState::Input, "Input is not cleared");
    }

    #[test]
    fn test_password_clear_timer_erases_in_any_state() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        auth.handle(AuthEvent::PasswordClearElapsed);
        assert_eq!(auth.password.len(), 0);
        assert_eq!(auth.state, AuthState::Input, "state is left alone");
    }

    #[test]
    fn test_password_clear_timer_skips_validating() {
        let mut auth = Auth::new(false);
        key(&mut auth, 'a');
        special(&mut auth, Keysym::Return);
        auth.handle(AuthEvent::PasswordClearElapsed);
        assert_eq!(auth.password.as_str(), "a", "buffer is on loan to the verifier");
    }

    #[test]
    fn test_replay_determinism() {
        let run = || {
            let mut auth = Auth::new(false);
            let mut trace = Vec::new();
            key(&mut auth, 'x');
            trace.push(auth.state);
            special(&mut auth, Keysym::BackSpace);
            trace.push(auth.state);
            special(&mut auth, Keysym::BackSpace);
            trace.push(auth.state);
            key(&mut auth, 'y');
            trace.push(auth.state);
            special(&mut auth, Keysym::Return);
            trace.push(auth.state);
            auth.handle(AuthEvent::Verdict(Verdict::Rejected));
            trace.push(auth.state);
            auth.handle(AuthEvent::IndicatorClearElapsed);
            trace.push(auth.state);
            (trace, auth.failed_attempts)
        };
        assert_eq!(run(), run());
    }
}
