//! Embedded Wayland server for the background plugin.
//!
//! The plugin runs as an ordinary Wayland client against a private socket
//! this server listens on. It sees a small compositor: wl_compositor,
//! wl_shm, linux-dmabuf, wl_drm, a wl_output per lock output and an
//! emulated wlr-layer-shell. Exactly one client is served at a time; a
//! second connection is refused while the first is alive, and the
//! endpoint outlives its client so the next connection is served.

use std::cell::RefCell;
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::process::{Child, Command};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use calloop::generic::Generic;
use calloop::{Interest, Mode, PostAction, RegistrationToken};
use wayland_backend::server::{ClientData, ClientId, DisconnectReason, GlobalId};
use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::xdg::xdg_output::zv1::server::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols_wlr::layer_shell::v1::server::zwlr_layer_shell_v1::ZwlrLayerShellV1;
use wayland_server::protocol::{
    wl_compositor, wl_output, wl_shm, wl_subcompositor,
};
use wayland_server::{Client, Display, DisplayHandle, ListeningSocket};

use crate::core::forward::{clamp_version, ForwardState};
use crate::core::state::LockState;
use crate::protocols::wl_drm::server::wl_drm::WlDrm;

const COMPOSITOR_VERSION: u32 = 6;
const DMABUF_VERSION: u32 = 5;
const LAYER_SHELL_VERSION: u32 = 4;
const XDG_OUTPUT_VERSION: u32 = 3;
const OUTPUT_VERSION: u32 = 4;

/// Per-client backend data; flags the disconnect so the dispatch source
/// can end the session outside the backend callback.
#[derive(Default)]
pub struct PluginClientData {
    disconnected: AtomicBool,
}

impl ClientData for PluginClientData {
    fn initialized(&self, _client_id: ClientId) {}

    fn disconnected(&self, _client_id: ClientId, _reason: DisconnectReason) {
        self.disconnected.store(true, Ordering::Release);
    }
}

pub struct PluginServer {
    pub display: Rc<RefCell<Display<LockState>>>,
    pub handle: DisplayHandle,
    pub socket_name: OsString,
    pub client: Option<Client>,
    client_data: Option<Arc<PluginClientData>>,
    pub forward: ForwardState,
    globals: Vec<GlobalId>,
    child: Option<Child>,
    tokens: Vec<RegistrationToken>,
}

impl PluginServer {
    fn client_gone(&self) -> bool {
        self.client_data
            .as_ref()
            .is_some_and(|d| d.disconnected.load(Ordering::Acquire))
    }

    pub(crate) fn has_live_client(&self) -> bool {
        self.client.is_some() && !self.client_gone()
    }

    /// Admit one connection as the plugin client. A stream arriving while
    /// another client is alive is dropped; returns whether the stream was
    /// taken as the live client.
    pub(crate) fn admit(&mut self, stream: std::os::unix::net::UnixStream) -> bool {
        if self.has_live_client() {
            tracing::warn!("refusing second plugin connection");
            return false;
        }
        let data = Arc::new(PluginClientData::default());
        match self.handle.insert_client(stream, data.clone()) {
            Ok(client) => {
                tracing::info!("plugin connected");
                self.client = Some(client);
                self.client_data = Some(data);
                true
            }
            Err(e) => {
                tracing::warn!("failed to accept plugin: {e}");
                false
            }
        }
    }

    fn clear_client(&mut self) {
        self.client = None;
        self.client_data = None;
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let display = Display::<LockState>::new().unwrap();
        let handle = display.handle();
        Self {
            display: Rc::new(RefCell::new(display)),
            handle,
            socket_name: OsString::from("lockgate-test"),
            client: None,
            client_data: None,
            forward: ForwardState::default(),
            globals: Vec::new(),
            child: None,
            tokens: Vec::new(),
        }
    }
}

/// Bring up the plugin server and spawn the configured command. Called
/// once the session is locked; without a plugin command this is a no-op
/// and the solid color painter covers the outputs.
pub fn start_plugin(state: &mut LockState) -> Result<()> {
    let Some(command) = state.config.plugin_command.clone() else {
        return Ok(());
    };
    if state.plugin.is_some() {
        return Ok(());
    }
    if state.subcompositor.is_none() {
        return Err(anyhow!("compositor lacks wl_subcompositor"));
    }

    let display = Display::<LockState>::new().context("create plugin display")?;
    let handle = display.handle();

    let mut globals = Vec::new();
    if let Some(version) = clamp_version(state.upstream_version("wl_compositor"), COMPOSITOR_VERSION)
    {
        globals.push(handle.create_global::<LockState, wl_compositor::WlCompositor, _>(version, ()));
    }
    globals.push(handle.create_global::<LockState, wl_subcompositor::WlSubcompositor, _>(1, ()));
    globals.push(handle.create_global::<LockState, wl_shm::WlShm, _>(1, ()));
    if let Some(dmabuf) = state.dmabuf.as_ref() {
        use wayland_client::Proxy;
        let version = dmabuf.version().min(DMABUF_VERSION);
        globals.push(handle.create_global::<LockState, ZwpLinuxDmabufV1, _>(version, ()));
    }
    if let Some(drm) = state.drm.as_ref() {
        use wayland_client::Proxy;
        globals.push(handle.create_global::<LockState, WlDrm, _>(drm.version(), ()));
    }
    globals.push(handle.create_global::<LockState, ZwlrLayerShellV1, _>(LAYER_SHELL_VERSION, ()));
    globals.push(handle.create_global::<LockState, ZxdgOutputManagerV1, _>(XDG_OUTPUT_VERSION, ()));
    for surface in &mut state.surfaces {
        surface.downstream_global = Some(
            handle.create_global::<LockState, wl_output::WlOutput, _>(
                OUTPUT_VERSION,
                surface.output_name,
            ),
        );
    }

    let socket = ListeningSocket::bind_auto("lockgate", 1..32).context("bind plugin socket")?;
    let socket_name = socket
        .socket_name()
        .ok_or_else(|| anyhow!("plugin socket has no name"))?
        .to_os_string();

    let display = Rc::new(RefCell::new(display));
    state.plugin = Some(PluginServer {
        display: display.clone(),
        handle,
        socket_name: socket_name.clone(),
        client: None,
        client_data: None,
        forward: ForwardState::default(),
        globals,
        child: None,
        tokens: Vec::new(),
    });

    let listen_token = state
        .loop_handle
        .insert_source(
            Generic::new(socket, Interest::READ, Mode::Level),
            move |_, socket, state: &mut LockState| {
                while let Some(stream) = socket.accept()? {
                    let Some(plugin) = state.plugin.as_mut() else {
                        break;
                    };
                    plugin.admit(stream);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|_| anyhow!("register plugin listen source"))?;

    let poll_fd: OwnedFd = display
        .borrow_mut()
        .backend()
        .poll_fd()
        .try_clone_to_owned()
        .context("clone plugin display fd")?;
    let dispatch_display = display.clone();
    let dispatch_token = state
        .loop_handle
        .insert_source(
            Generic::new(poll_fd, Interest::READ, Mode::Level),
            move |_, _, state: &mut LockState| {
                let gone = {
                    let mut display = dispatch_display.borrow_mut();
                    if let Err(e) = display.dispatch_clients(state) {
                        tracing::warn!("plugin dispatch error: {e}");
                    }
                    let _ = display.flush_clients();
                    state.plugin.as_ref().is_some_and(|p| p.client.is_some() && p.client_gone())
                };
                if gone {
                    disconnect_plugin(state, "plugin disconnected");
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|_| anyhow!("register plugin dispatch source"))?;

    if let Some(plugin) = state.plugin.as_mut() {
        plugin.tokens.push(listen_token);
        plugin.tokens.push(dispatch_token);
    }

    tracing::info!("plugin server listening on {socket_name:?}");
    // The plugin must find our socket, not inherit the upstream session.
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .env("WAYLAND_DISPLAY", &socket_name)
        .env_remove("WAYLAND_SOCKET")
        .spawn()
        .context("spawn plugin command")?;
    if let Some(plugin) = state.plugin.as_mut() {
        plugin.child = Some(child);
    }
    Ok(())
}

/// End the current plugin client session and fall back to the solid color,
/// keeping the endpoint alive. The globals and listening socket stay
/// registered so the next connection is served fresh.
pub fn disconnect_plugin(state: &mut LockState, why: &str) {
    let Some(plugin) = state.plugin.as_mut() else {
        return;
    };
    tracing::info!("plugin session ended: {why}");

    plugin.clear_client();
    plugin.forward.destroy_upstream();
    if let Some(child) = plugin.child.as_mut() {
        // Reap the command if it already exited; a survivor may reconnect.
        if matches!(child.try_wait(), Ok(Some(_))) {
            plugin.child = None;
        }
    }
    let _ = plugin.display.borrow_mut().flush_clients();
    for surface in &mut state.surfaces {
        if let Some(child) = surface.plugin_child.take() {
            child.subsurface.destroy();
        }
        surface.downstream_outputs.clear();
        surface.downstream_xdg_outputs.clear();
    }

    state.render_all();
}

/// Tear the whole plugin session down and fall back to the solid color.
pub fn teardown_plugin(state: &mut LockState, why: &str) {
    let Some(mut plugin) = state.plugin.take() else {
        return;
    };
    tracing::info!("stopping plugin: {why}");

    plugin.forward.destroy_upstream();
    for surface in &mut state.surfaces {
        if let Some(child) = surface.plugin_child.take() {
            child.subsurface.destroy();
        }
        surface.downstream_global = None;
        surface.downstream_outputs.clear();
        surface.downstream_xdg_outputs.clear();
    }
    for global in plugin.globals.drain(..) {
        plugin.handle.remove_global::<LockState>(global);
    }
    for token in plugin.tokens.drain(..) {
        state.loop_handle.remove(token);
    }
    if let Some(mut child) = plugin.child.take() {
        let _ = child.kill();
        let _ = child.wait();
    }
    let _ = plugin.display.borrow_mut().flush_clients();

    state.render_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_admit_takes_first_connection() {
        let mut server = PluginServer::for_tests();
        let (stream, _peer) = UnixStream::pair().unwrap();
        assert!(server.admit(stream));
        assert!(server.has_live_client());
    }

    #[test]
    fn test_admit_refuses_second_live_connection() {
        let mut server = PluginServer::for_tests();
        let (first, _first_peer) = UnixStream::pair().unwrap();
        let (second, _second_peer) = UnixStream::pair().unwrap();
        assert!(server.admit(first));
        assert!(!server.admit(second));
        // The first client is still the one being served.
        assert!(server.has_live_client());
    }

    #[test]
    fn test_admit_accepts_after_disconnect() {
        let mut server = PluginServer::for_tests();
        let (first, _first_peer) = UnixStream::pair().unwrap();
        assert!(server.admit(first));

        // Backend flags the disconnect; the dispatch source then clears
        // the client slot without dropping the endpoint.
        server
            .client_data
            .as_ref()
            .unwrap()
            .disconnected
            .store(true, Ordering::Release);
        assert!(!server.has_live_client());
        server.clear_client();

        let (second, _second_peer) = UnixStream::pair().unwrap();
        assert!(server.admit(second));
        assert!(server.has_live_client());
    }

    #[test]
    fn test_disconnect_keeps_endpoint_state() {
        let mut server = PluginServer::for_tests();
        let global = server
            .handle
            .create_global::<LockState, wl_compositor::WlCompositor, _>(1, ());
        server.globals.push(global);
        let (stream, _peer) = UnixStream::pair().unwrap();
        assert!(server.admit(stream));

        server.clear_client();
        server.forward.destroy_upstream();

        // Globals stay registered; only the client slot is vacated.
        assert_eq!(server.globals.len(), 1);
        assert!(server.client.is_none());
        assert!(!server.has_live_client());
    }
}
