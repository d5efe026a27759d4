//! Keyboard input translation.
//!
//! The compositor hands us an xkb keymap over an fd; every key press is
//! resolved to a keysym plus an optional UTF-32 codepoint and fed to the
//! authentication machine. Key repeat is deliberately not implemented;
//! holding a key while typing a password is not a case worth the timer.

use std::os::fd::OwnedFd;

use wayland_client::protocol::wl_keyboard;
use xkbcommon::xkb;

use crate::core::auth::AuthEvent;

pub struct KeyboardState {
    pub wl_keyboard: Option<wl_keyboard::WlKeyboard>,
    context: xkb::Context,
    state: Option<xkb::State>,
}

impl KeyboardState {
    pub fn new() -> Self {
        Self {
            wl_keyboard: None,
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            state: None,
        }
    }

    /// Load the keymap the compositor sent. A malformed map leaves the
    /// previous one (if any) in place.
    pub fn load_keymap(&mut self, fd: OwnedFd, size: u32) {
        let keymap = unsafe {
            xkb::Keymap::new_from_fd(
                &self.context,
                fd,
                size as usize,
                xkb::KEYMAP_FORMAT_TEXT_V1,
                xkb::KEYMAP_COMPILE_NO_FLAGS,
            )
        };
        match keymap {
            Ok(Some(keymap)) => {
                self.state = Some(xkb::State::new(&keymap));
            }
            Ok(None) => tracing::warn!("compositor sent an uncompilable keymap"),
            Err(e) => tracing::warn!("failed to read keymap fd: {e}"),
        }
    }

    pub fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        if let Some(state) = self.state.as_mut() {
            state.update_mask(depressed, latched, locked, 0, 0, group);
        }
    }

    /// Translate a pressed key (evdev code, pre xkb offset) into an auth
    /// event. Returns `None` before a keymap has arrived.
    pub fn key_pressed(&self, key: u32) -> Option<AuthEvent> {
        let state = self.state.as_ref()?;
        let keycode = xkb::Keycode::from(key + 8);
        let keysym = state.key_get_one_sym(keycode);
        let codepoint = char::from_u32(state.key_get_utf32(keycode)).filter(|c| *c != '\0');
        let ctrl = state.mod_name_is_active(xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE);
        Some(AuthEvent::Key {
            keysym,
            codepoint,
            ctrl,
        })
    }

    pub fn caps_lock_active(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.mod_name_is_active(xkb::MOD_NAME_CAPS, xkb::STATE_MODS_LOCKED))
            .unwrap_or(false)
    }
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self::new()
    }
}
