//! Plugin endpoint tests over in-process socket pairs.
//!
//! The upstream connection is a dangling socket: requests to it are
//! buffered and never flushed, which is enough to exercise the embedded
//! server's dispatch against a real plugin client.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use wayland_client::protocol::{
    wl_compositor as c_compositor, wl_registry as c_registry, wl_shm as c_shm,
    wl_subcompositor as c_subcompositor, wl_subsurface as c_subsurface, wl_surface as c_surface,
};
use wayland_client::{Connection, EventQueue, QueueHandle};
use wayland_protocols::ext::session_lock::v1::client::ext_session_lock_manager_v1::ExtSessionLockManagerV1;
use wayland_server::protocol::{wl_compositor as s_compositor, wl_subcompositor as s_subcompositor};

use crate::config::Config;
use crate::core::auth::{Auth, Verifier};
use crate::core::feedback::FeedbackSync;
use crate::core::forward::drm::DrmInfo;
use crate::core::server::{disconnect_plugin, PluginServer};
use crate::core::state::{LockState, Timers};
use crate::core::surface::SolidPainter;
use crate::core::upstream::seat::KeyboardState;

wayland_client::delegate_noop!(LockState: ignore c_registry::WlRegistry);

/// A locker state wired to a dangling upstream socket, plus everything
/// that has to outlive it.
struct Harness {
    state: LockState,
    _event_loop: calloop::EventLoop<'static, LockState>,
    _upstream_queue: EventQueue<LockState>,
    _upstream_conn: Connection,
    _upstream_peer: UnixStream,
    _verifier_peer: UnixStream,
}

fn harness() -> Harness {
    let (upstream_sock, upstream_peer) = UnixStream::pair().unwrap();
    let conn = Connection::from_socket(upstream_sock).unwrap();
    let queue = conn.new_event_queue::<LockState>();
    let qh = queue.handle();
    let registry = conn.display().get_registry(&qh, ());

    // Global names are arbitrary; nothing reads the upstream socket.
    let compositor: c_compositor::WlCompositor = registry.bind(1, 5, &qh, ());
    let subcompositor: c_subcompositor::WlSubcompositor = registry.bind(2, 1, &qh, ());
    let shm: c_shm::WlShm = registry.bind(3, 1, &qh, ());
    let lock_manager: ExtSessionLockManagerV1 = registry.bind(4, 1, &qh, ());

    let event_loop = calloop::EventLoop::try_new().unwrap();
    let loop_handle = event_loop.handle();
    let (verifier_sock, verifier_peer) = UnixStream::pair().unwrap();

    let config = Config::default();
    let painter = SolidPainter::new(config.color);
    let auth = Auth::new(config.ignore_empty);
    let state = LockState {
        qh,
        loop_handle,
        config,
        compositor,
        subcompositor: Some(subcompositor),
        shm,
        lock_manager,
        dmabuf: None,
        drm: None,
        drm_info: DrmInfo::default(),
        upstream_versions: HashMap::new(),
        lock: None,
        locked: true,
        surfaces: Vec::new(),
        keyboard: KeyboardState::new(),
        painter,
        auth,
        verifier: Verifier::from_stream(verifier_sock),
        feedback: FeedbackSync::new(),
        plugin: None,
        timers: Timers::default(),
        running: true,
    };

    Harness {
        state,
        _event_loop: event_loop,
        _upstream_queue: queue,
        _upstream_conn: conn,
        _upstream_peer: upstream_peer,
        _verifier_peer: verifier_peer,
    }
}

/// Install a plugin endpoint with the compositor and subcompositor
/// globals a background client would bind.
fn install_endpoint(state: &mut LockState) {
    let plugin = PluginServer::for_tests();
    plugin
        .handle
        .create_global::<LockState, s_compositor::WlCompositor, _>(4, ());
    plugin
        .handle
        .create_global::<LockState, s_subcompositor::WlSubcompositor, _>(1, ());
    state.plugin = Some(plugin);
}

fn pump_server(state: &mut LockState) {
    let display = state.plugin.as_ref().unwrap().display.clone();
    let mut display = display.borrow_mut();
    let _ = display.dispatch_clients(state);
    let _ = display.flush_clients();
}

fn pump_client(queue: &mut EventQueue<PluginClient>, client: &mut PluginClient) {
    let _ = queue.flush();
    if let Some(guard) = queue.prepare_read() {
        let _ = guard.read();
    }
    let _ = queue.dispatch_pending(client);
}

/// Minimal state for the client end of the plugin connection.
#[derive(Default)]
struct PluginClient {
    globals: Vec<(u32, String, u32)>,
}

impl wayland_client::Dispatch<c_registry::WlRegistry, ()> for PluginClient {
    fn event(
        state: &mut Self,
        _proxy: &c_registry::WlRegistry,
        event: c_registry::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let c_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            state.globals.push((name, interface, version));
        }
    }
}

wayland_client::delegate_noop!(PluginClient: ignore c_compositor::WlCompositor);
wayland_client::delegate_noop!(PluginClient: ignore c_subcompositor::WlSubcompositor);
wayland_client::delegate_noop!(PluginClient: ignore c_surface::WlSurface);
wayland_client::delegate_noop!(PluginClient: ignore c_subsurface::WlSubsurface);

struct PluginConn {
    conn: Connection,
    queue: EventQueue<PluginClient>,
    client: PluginClient,
    registry: c_registry::WlRegistry,
}

/// Connect a plugin client over a socket pair and pull the global list.
fn connect_plugin_client(state: &mut LockState) -> Option<PluginConn> {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    if !state.plugin.as_mut().unwrap().admit(server_sock) {
        return None;
    }
    let conn = Connection::from_socket(client_sock).unwrap();
    let mut queue = conn.new_event_queue::<PluginClient>();
    let qh = queue.handle();
    let registry = conn.display().get_registry(&qh, ());
    let mut client = PluginClient::default();
    let _ = queue.flush();
    pump_server(state);
    pump_client(&mut queue, &mut client);
    Some(PluginConn {
        conn,
        queue,
        client,
        registry,
    })
}

impl PluginConn {
    fn global(&self, interface: &str) -> (u32, u32) {
        let entry = self
            .client
            .globals
            .iter()
            .find(|(_, name, _)| name == interface)
            .unwrap_or_else(|| panic!("endpoint must advertise {interface}"));
        (entry.0, entry.2)
    }
}

#[test]
fn test_endpoint_advertises_globals() {
    let mut h = harness();
    install_endpoint(&mut h.state);
    let plugin = connect_plugin_client(&mut h.state).unwrap();

    let (_, compositor_version) = plugin.global("wl_compositor");
    assert_eq!(compositor_version, 4);
    let (_, subcompositor_version) = plugin.global("wl_subcompositor");
    assert_eq!(subcompositor_version, 1);
}

#[test]
fn test_surfaces_forward_upstream() {
    let mut h = harness();
    install_endpoint(&mut h.state);
    let plugin = connect_plugin_client(&mut h.state).unwrap();

    let (name, version) = plugin.global("wl_compositor");
    let qh = plugin.queue.handle();
    let compositor: c_compositor::WlCompositor = plugin.registry.bind(name, version, &qh, ());
    let _first = compositor.create_surface(&qh, ());
    let _second = compositor.create_surface(&qh, ());
    let _ = plugin.queue.flush();
    pump_server(&mut h.state);

    let forward = &h.state.plugin.as_ref().unwrap().forward;
    assert_eq!(forward.surfaces.len(), 2);
}

#[test]
fn test_subsurface_request_kills_client() {
    let mut h = harness();
    install_endpoint(&mut h.state);
    let mut plugin = connect_plugin_client(&mut h.state).unwrap();

    let qh = plugin.queue.handle();
    let (comp_name, comp_version) = plugin.global("wl_compositor");
    let (sub_name, sub_version) = plugin.global("wl_subcompositor");
    let compositor: c_compositor::WlCompositor =
        plugin.registry.bind(comp_name, comp_version, &qh, ());
    let subcompositor: c_subcompositor::WlSubcompositor =
        plugin.registry.bind(sub_name, sub_version, &qh, ());

    let parent = compositor.create_surface(&qh, ());
    let child = compositor.create_surface(&qh, ());
    let _subsurface = subcompositor.get_subsurface(&child, &parent, &qh, ());
    let _ = plugin.queue.flush();
    pump_server(&mut h.state);
    pump_server(&mut h.state);
    pump_client(&mut plugin.queue, &mut plugin.client);

    let err = plugin
        .conn
        .protocol_error()
        .expect("subsurface request must be a protocol error");
    assert_eq!(err.code, u32::from(c_subcompositor::Error::BadSurface));

    // The endpoint survives the dead client; forwarded state is cleaned
    // up and the next connection is served.
    disconnect_plugin(&mut h.state, "client killed");
    let endpoint = h.state.plugin.as_ref().expect("endpoint stays up");
    assert!(endpoint.client.is_none());
    assert!(endpoint.forward.surfaces.is_empty());

    let next = connect_plugin_client(&mut h.state).expect("endpoint accepts a new client");
    assert!(!next.client.globals.is_empty());
}
