//! Process entry and event loop.
//!
//! Everything runs on one calloop loop: the upstream Wayland connection,
//! the plugin server's listening and dispatch fds, the verifier pipe and
//! the two auth timers. The verifier child is forked before anything else
//! so the locker can shed setuid privileges before it speaks Wayland.

use anyhow::{anyhow, Context, Result};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, Mode, PostAction};
use calloop_wayland_source::WaylandSource;
use wayland_client::globals::registry_queue_init;
use wayland_client::Connection;

use crate::config::Config;
use crate::core::auth::{verifier, AuthAction, AuthEvent, Verdict, Verifier};
use crate::core::server;
use crate::core::state::LockState;

pub fn run(config: Config) -> Result<()> {
    // Fork the verifier first: it keeps whatever privilege shadow access
    // needs, the locker itself drops it before touching the display.
    let verifier = Verifier::spawn().context("spawn credential verifier")?;
    verifier::drop_privileges().context("drop privileges")?;

    let conn = Connection::connect_to_env().context("connect to compositor")?;
    let (globals, mut event_queue) =
        registry_queue_init::<LockState>(&conn).context("read registry")?;
    let qh = event_queue.handle();

    let mut event_loop: EventLoop<LockState> =
        EventLoop::try_new().context("create event loop")?;

    let verifier_fd = verifier
        .stream()
        .try_clone()
        .context("clone verifier stream")?;

    let mut state = LockState::new(&globals, qh, event_loop.handle(), config, verifier)?;
    state.bind_initial_globals(&globals);

    // Lock immediately; surfaces follow once `locked` arrives.
    let lock = state.lock_manager.lock(&state.qh, ());
    state.lock = Some(lock);

    // Drain output metadata, shm/dmabuf formats and the first feedback
    // batch before the plugin can ask for any of it.
    event_queue.roundtrip(&mut state).context("initial roundtrip")?;
    event_queue.roundtrip(&mut state).context("initial roundtrip")?;

    event_loop
        .handle()
        .insert_source(
            Generic::new(verifier_fd, Interest::READ, Mode::Level),
            |_, _, state: &mut LockState| {
                if state.verifier.is_outstanding() {
                    let verdict = state.verifier.read_verdict();
                    state.process_auth_event(AuthEvent::Verdict(verdict));
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|_| anyhow!("register verifier source"))?;

    WaylandSource::new(conn.clone(), event_queue)
        .insert(event_loop.handle())
        .map_err(|_| anyhow!("register wayland source"))?;

    while state.running {
        event_loop
            .dispatch(None, &mut state)
            .context("event loop")?;
        if let Some(plugin) = state.plugin.as_ref() {
            let _ = plugin.display.borrow_mut().flush_clients();
        }
    }

    server::teardown_plugin(&mut state, "session unlocked");

    // unlock_and_destroy must reach the compositor before exit, or the
    // session stays locked with no locker attached.
    let mut queue = conn.new_event_queue::<LockState>();
    queue.roundtrip(&mut state).context("final roundtrip")?;
    Ok(())
}

impl LockState {
    pub fn process_auth_event(&mut self, event: AuthEvent) {
        let actions = self.auth.handle(event);
        self.apply_auth_actions(actions);
    }

    fn apply_auth_actions(&mut self, actions: Vec<AuthAction>) {
        for action in actions {
            match action {
                AuthAction::Submit => {
                    if let Err(e) = self.verifier.submit(self.auth.password.as_str()) {
                        tracing::error!("failed to reach verifier: {e}");
                        self.process_auth_event(AuthEvent::Verdict(Verdict::Unavailable));
                    }
                }
                AuthAction::Unlock => self.unlock(),
                AuthAction::ScheduleIndicatorClear => self.schedule_indicator_clear(),
                AuthAction::SchedulePasswordClear => self.schedule_password_clear(),
                AuthAction::Redraw => self.render_all(),
            }
        }
    }

    fn schedule_indicator_clear(&mut self) {
        if let Some(token) = self.timers.indicator_clear.take() {
            self.loop_handle.remove(token);
        }
        let timer = Timer::from_duration(self.config.indicator_clear_after);
        let token = self
            .loop_handle
            .insert_source(timer, |_, _, state: &mut LockState| {
                state.timers.indicator_clear = None;
                state.process_auth_event(AuthEvent::IndicatorClearElapsed);
                TimeoutAction::Drop
            });
        match token {
            Ok(token) => self.timers.indicator_clear = Some(token),
            Err(e) => tracing::warn!("failed to arm indicator timer: {e}"),
        }
    }

    fn schedule_password_clear(&mut self) {
        if let Some(token) = self.timers.password_clear.take() {
            self.loop_handle.remove(token);
        }
        let timer = Timer::from_duration(self.config.password_clear_after);
        let token = self
            .loop_handle
            .insert_source(timer, |_, _, state: &mut LockState| {
                state.timers.password_clear = None;
                state.process_auth_event(AuthEvent::PasswordClearElapsed);
                TimeoutAction::Drop
            });
        match token {
            Ok(token) => self.timers.password_clear = Some(token),
            Err(e) => tracing::warn!("failed to arm password timer: {e}"),
        }
    }
}
