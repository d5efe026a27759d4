//! Upstream compositor session.
//!
//! Everything the locker itself speaks to the real compositor lives here:
//! registry tracking, outputs, seat input, the session lock, and dmabuf
//! format discovery. Forwarded plugin traffic has its own dispatch impls
//! under `core::forward`; this module only handles resources the locker
//! owns.

pub mod seat;

use wayland_client::globals::{GlobalList, GlobalListContents};
use wayland_client::protocol::{
    wl_compositor, wl_keyboard, wl_output, wl_registry, wl_seat, wl_shm, wl_shm_pool,
    wl_subcompositor, wl_subsurface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols::ext::session_lock::v1::client::{
    ext_session_lock_manager_v1, ext_session_lock_surface_v1, ext_session_lock_v1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_feedback_v1 as c_feedback;
use wayland_server::protocol::wl_output as s_output;
use wayland_server::Resource;

use crate::core::forward::{dmabuf::send_feedback, layer_shell, output as fwd_output};
use crate::core::server;
use crate::core::state::LockState;
use crate::core::surface::{BackgroundPainter, LockSurface, OutputGeometry};

/// Highest wl_output version we track and mirror.
const OUTPUT_VERSION: u32 = 4;
const SEAT_VERSION: u32 = 7;

fn wenum_raw<T: Into<u32>>(value: WEnum<T>) -> u32 {
    match value {
        WEnum::Value(v) => v.into(),
        WEnum::Unknown(v) => v,
    }
}

impl LockState {
    /// Bind the multi-instance globals from the initial registry snapshot.
    /// Later arrivals come in through the registry dispatch below.
    pub fn bind_initial_globals(&mut self, globals: &GlobalList) {
        let registry = globals.registry().clone();
        let qh = self.qh.clone();
        for global in globals.contents().clone_list() {
            match global.interface.as_str() {
                "wl_output" => {
                    self.add_output(&registry, &qh, global.name, global.version);
                }
                "wl_seat" => {
                    registry.bind::<wl_seat::WlSeat, _, _>(
                        global.name,
                        global.version.min(SEAT_VERSION),
                        &qh,
                        (),
                    );
                }
                _ => {}
            }
        }
    }

    fn add_output(
        &mut self,
        registry: &wl_registry::WlRegistry,
        qh: &QueueHandle<LockState>,
        name: u32,
        version: u32,
    ) {
        let output = registry.bind::<wl_output::WlOutput, _, _>(
            name,
            version.min(OUTPUT_VERSION),
            qh,
            name,
        );
        let mut surface = LockSurface::new(name, output);
        if let Some(plugin) = self.plugin.as_ref() {
            surface.downstream_global = Some(plugin.handle.create_global::<LockState, s_output::WlOutput, u32>(
                version.min(OUTPUT_VERSION),
                name,
            ));
        }
        self.surfaces.push(surface);
        tracing::debug!("output {name} appeared");
        self.ensure_lock_surfaces();
    }

    fn remove_output(&mut self, name: u32) {
        let Some(pos) = self.surfaces.iter().position(|s| s.output_name == name) else {
            return;
        };
        let mut surface = self.surfaces.remove(pos);
        tracing::debug!("output {name} disappeared");
        if let Some(child) = surface.plugin_child.as_ref() {
            let key = child.key;
            if let Some(plugin) = self.plugin.as_mut() {
                if let Some(fwd) = plugin.forward.surfaces.get_mut(&key) {
                    if let Some(layer) = fwd.layer.take() {
                        layer.resource.closed();
                    }
                }
            }
        }
        if let Some(id) = surface.downstream_global.take() {
            if let Some(plugin) = self.plugin.as_ref() {
                plugin.handle.disable_global::<LockState>(id.clone());
                plugin.handle.remove_global::<LockState>(id);
            }
        }
        surface.destroy();
        if surface.output.version() >= 3 {
            surface.output.release();
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for LockState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                state.upstream_versions.insert(interface.clone(), version);
                match interface.as_str() {
                    "wl_output" => state.add_output(registry, qh, name, version),
                    "wl_seat" => {
                        registry.bind::<wl_seat::WlSeat, _, _>(
                            name,
                            version.min(SEAT_VERSION),
                            qh,
                            (),
                        );
                    }
                    _ => {}
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.remove_output(name);
            }
            _ => {}
        }
    }
}

// ===== Outputs =====

impl Dispatch<wl_output::WlOutput, u32> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &wl_output::WlOutput,
        event: wl_output::Event,
        data: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let name = *data;
        let Some(surface) = state.surfaces.iter_mut().find(|s| s.output_name == name) else {
            return;
        };
        match event {
            wl_output::Event::Geometry {
                x,
                y,
                physical_width,
                physical_height,
                subpixel,
                make,
                model,
                transform,
            } => {
                surface.info.geometry = Some(OutputGeometry {
                    x,
                    y,
                    physical_width,
                    physical_height,
                    subpixel: wenum_raw(subpixel),
                    make,
                    model,
                    transform: wenum_raw(transform),
                });
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                if let WEnum::Value(flags) = flags {
                    if flags.contains(wl_output::Mode::Current) {
                        surface.info.mode = Some((width, height, refresh));
                    }
                }
            }
            wl_output::Event::Scale { factor } => {
                surface.info.scale = factor;
            }
            wl_output::Event::Name { name } => {
                surface.info.name = Some(name);
            }
            wl_output::Event::Description { description } => {
                surface.info.description = Some(description);
            }
            wl_output::Event::Done => {
                fwd_output::broadcast_output_info(state, name);
            }
            _ => {}
        }
    }
}

// ===== Seat and keyboard =====

impl Dispatch<wl_seat::WlSeat, ()> for LockState {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities { capabilities } = event {
            let WEnum::Value(capabilities) = capabilities else {
                return;
            };
            let has_keyboard = capabilities.contains(wl_seat::Capability::Keyboard);
            if has_keyboard && state.keyboard.wl_keyboard.is_none() {
                state.keyboard.wl_keyboard = Some(seat.get_keyboard(qh, ()));
            } else if !has_keyboard {
                if let Some(keyboard) = state.keyboard.wl_keyboard.take() {
                    keyboard.release();
                }
            }
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => {
                if let WEnum::Value(wl_keyboard::KeymapFormat::XkbV1) = format {
                    state.keyboard.load_keymap(fd, size);
                }
            }
            wl_keyboard::Event::Key {
                key,
                state: key_state,
                ..
            } => {
                if let WEnum::Value(wl_keyboard::KeyState::Pressed) = key_state {
                    if let Some(event) = state.keyboard.key_pressed(key) {
                        state.process_auth_event(event);
                    }
                }
            }
            wl_keyboard::Event::Modifiers {
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
                ..
            } => {
                state
                    .keyboard
                    .update_modifiers(mods_depressed, mods_latched, mods_locked, group);
            }
            _ => {}
        }
    }
}

// ===== Session lock =====

impl Dispatch<ext_session_lock_v1::ExtSessionLockV1, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &ext_session_lock_v1::ExtSessionLockV1,
        event: ext_session_lock_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            ext_session_lock_v1::Event::Locked => {
                tracing::info!("session locked");
                state.locked = true;
                state.ensure_lock_surfaces();
                if let Err(e) = server::start_plugin(state) {
                    tracing::warn!("plugin startup failed, using solid color: {e:#}");
                }
            }
            ext_session_lock_v1::Event::Finished => {
                if state.locked {
                    tracing::error!("compositor finished the session lock while locked");
                } else {
                    tracing::error!("compositor denied the session lock (already locked?)");
                }
                state.lock = None;
                state.running = false;
            }
            _ => {}
        }
    }
}

impl Dispatch<ext_session_lock_surface_v1::ExtSessionLockSurfaceV1, u32> for LockState {
    fn event(
        state: &mut Self,
        proxy: &ext_session_lock_surface_v1::ExtSessionLockSurfaceV1,
        event: ext_session_lock_surface_v1::Event,
        data: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let ext_session_lock_surface_v1::Event::Configure {
            serial,
            width,
            height,
        } = event
        else {
            return;
        };
        let name = *data;
        // Ack must precede the commit the paint below performs.
        proxy.ack_configure(serial);
        let Some(surface) = state.surfaces.iter_mut().find(|s| s.output_name == name) else {
            return;
        };
        surface.width = width;
        surface.height = height;
        surface.configured = true;
        if let Err(e) = state.painter.paint(&state.shm, &state.qh, surface) {
            tracing::warn!("painting output {name} failed: {e}");
        }
        layer_shell::configure_plugin_child(state, name, width, height);
    }
}

// ===== dmabuf feedback =====

fn parse_device(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(array))
}

impl Dispatch<c_feedback::ZwpLinuxDmabufFeedbackV1, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_feedback::ZwpLinuxDmabufFeedbackV1,
        event: c_feedback::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            c_feedback::Event::FormatTable { fd, size } => {
                state.feedback.handle_format_table(fd, size);
            }
            c_feedback::Event::MainDevice { device } => {
                if let Some(device) = parse_device(&device) {
                    state.feedback.handle_main_device(device);
                }
            }
            c_feedback::Event::TrancheTargetDevice { device } => {
                if let Some(device) = parse_device(&device) {
                    state.feedback.handle_tranche_target_device(device);
                }
            }
            c_feedback::Event::TrancheFormats { indices } => {
                state.feedback.handle_tranche_formats(&indices);
            }
            c_feedback::Event::TrancheFlags { flags } => {
                let raw = match flags {
                    WEnum::Value(flags) => flags.bits(),
                    WEnum::Unknown(raw) => raw,
                };
                state.feedback.handle_tranche_flags(raw);
            }
            c_feedback::Event::TrancheDone => {
                state.feedback.handle_tranche_done();
            }
            c_feedback::Event::Done => match state.feedback.handle_done() {
                Ok(()) => {
                    let listeners: Vec<_> = state
                        .plugin
                        .as_ref()
                        .map(|p| p.forward.feedback_listeners.clone())
                        .unwrap_or_default();
                    for listener in &listeners {
                        if listener.is_alive() {
                            send_feedback(listener, state.feedback.current());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("rejecting malformed dmabuf feedback: {e}");
                    server::teardown_plugin(state, "dmabuf feedback update was malformed");
                }
            },
            _ => {}
        }
    }
}

// ===== Event-free upstream objects =====

delegate_noop!(LockState: ignore wl_compositor::WlCompositor);
delegate_noop!(LockState: ignore wl_subcompositor::WlSubcompositor);
delegate_noop!(LockState: ignore wl_subsurface::WlSubsurface);
delegate_noop!(LockState: ignore wl_shm_pool::WlShmPool);
delegate_noop!(LockState: ignore ext_session_lock_manager_v1::ExtSessionLockManagerV1);
delegate_noop!(LockState: ignore wayland_client::protocol::wl_surface::WlSurface);

impl Dispatch<wl_shm::WlShm, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &wl_shm::WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            state.feedback.shm_formats.push(wenum_raw(format));
        }
    }
}
