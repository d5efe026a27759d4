//! Protocol forwarding between the plugin client and the upstream
//! compositor.
//!
//! Every downstream resource the plugin creates that has a real upstream
//! counterpart is linked to its client-side proxy through a `ForwardKey`.
//! The key is the resource user data on both sides, and `ForwardState`
//! holds the maps that resolve it. All forwarding is one plugin client at
//! a time; the maps are wiped wholesale on teardown.

pub mod compositor;
pub mod dmabuf;
pub mod drm;
pub mod layer_shell;
pub mod output;
pub mod shm;

use std::collections::HashMap;
use std::sync::OnceLock;

use wayland_client::protocol::{
    wl_buffer as c_buffer, wl_shm_pool as c_shm_pool, wl_surface as c_surface,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1 as c_params;
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1 as s_params, zwp_linux_dmabuf_feedback_v1 as s_feedback,
};
use wayland_protocols_wlr::layer_shell::v1::server::zwlr_layer_surface_v1 as s_layer_surface;
use wayland_server::protocol::{
    wl_buffer as s_buffer, wl_callback as s_callback, wl_surface as s_surface,
};

/// Stable identity linking a downstream resource to its upstream proxy.
/// Keys are never reused within one plugin session.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ForwardKey(pub u64);

/// Deferred key slot for upstream proxies whose identity is only known
/// after creation (buffers minted by a `created` event). Set exactly once.
#[derive(Default)]
pub struct ForwardKeyCell(OnceLock<u64>);

impl ForwardKeyCell {
    pub fn new() -> Self {
        Self(OnceLock::new())
    }

    pub fn set(&self, key: ForwardKey) {
        let _ = self.0.set(key.0);
    }

    pub fn get(&self) -> Option<ForwardKey> {
        self.0.get().copied().map(ForwardKey)
    }
}

/// A plugin surface and its upstream counterpart.
pub struct ForwardSurface {
    pub downstream: s_surface::WlSurface,
    pub upstream: c_surface::WlSurface,
    pub layer: Option<LayerRole>,
}

/// Staged attach, held back until the first configure is acked.
pub struct StagedAttach {
    pub buffer: Option<ForwardKey>,
    pub x: i32,
    pub y: i32,
}

/// Emulated wlr-layer-surface role on a forwarded surface. The upstream
/// side is a subsurface of the host lock surface, so configures come from
/// the session-lock dimensions, not from a real layer shell.
pub struct LayerRole {
    pub resource: s_layer_surface::ZwlrLayerSurfaceV1,
    /// Registry name of the lock output this role claimed. Set exactly
    /// once at role creation.
    pub output_name: u32,
    pub last_serial: u32,
    pub acked: bool,
    pub staged_attach: Option<StagedAttach>,
    pub staged_commit: bool,
}

pub struct ForwardBuffer {
    pub downstream: s_buffer::WlBuffer,
    pub upstream: c_buffer::WlBuffer,
}

#[derive(Default)]
pub struct ForwardState {
    next_key: u64,
    /// Serial counter for synthesized layer-surface configures.
    pub serial: u32,
    pub surfaces: HashMap<ForwardKey, ForwardSurface>,
    pub buffers: HashMap<ForwardKey, ForwardBuffer>,
    pub pools: HashMap<ForwardKey, c_shm_pool::WlShmPool>,
    pub params: HashMap<ForwardKey, ParamsLink>,
    /// Downstream frame callbacks awaiting the upstream `done`.
    pub callbacks: HashMap<ForwardKey, s_callback::WlCallback>,
    /// Plugin-side dmabuf feedback resources; replayed on every committed
    /// feedback change.
    pub feedback_listeners: Vec<s_feedback::ZwpLinuxDmabufFeedbackV1>,
    /// Plugin-side wl_drm resources for relayed device events.
    pub drm_resources: Vec<crate::protocols::wl_drm::server::wl_drm::WlDrm>,
}

pub struct ParamsLink {
    pub downstream: s_params::ZwpLinuxBufferParamsV1,
    pub upstream: c_params::ZwpLinuxBufferParamsV1,
}

impl ForwardState {
    pub fn alloc_key(&mut self) -> ForwardKey {
        self.next_key += 1;
        ForwardKey(self.next_key)
    }

    /// Destroy every upstream proxy this plugin session created. Called on
    /// plugin disconnect and on proxy teardown; downstream resources die
    /// with the client and need no individual destruction.
    pub fn destroy_upstream(&mut self) {
        for (_, surface) in self.surfaces.drain() {
            surface.upstream.destroy();
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.upstream.destroy();
        }
        for (_, pool) in self.pools.drain() {
            pool.destroy();
        }
        for (_, link) in self.params.drain() {
            link.upstream.destroy();
        }
        self.callbacks.clear();
        self.feedback_listeners.clear();
        self.drm_resources.clear();
    }
}

/// Version to advertise downstream for an interface: the upstream
/// compositor's version capped at what we implement. `None` means the
/// upstream lacks the interface and no global should be created.
pub fn clamp_version(upstream: Option<u32>, supported: u32) -> Option<u32> {
    let upstream = upstream?;
    Some(upstream.min(supported))
}

// ===== Buffer relays =====
//
// Shared by every buffer kind (shm, dmabuf, drm): the plugin's destroy is
// relayed upstream, and the upstream release travels back down.

use crate::core::state::LockState;
use wayland_server::Resource;

impl wayland_server::Dispatch<s_buffer::WlBuffer, ForwardKey> for LockState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &s_buffer::WlBuffer,
        request: s_buffer::Request,
        data: &ForwardKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        if let s_buffer::Request::Destroy = request {
            if let Some(plugin) = state.plugin.as_mut() {
                if let Some(buffer) = plugin.forward.buffers.remove(data) {
                    buffer.upstream.destroy();
                }
            }
        }
    }
}

impl wayland_client::Dispatch<c_buffer::WlBuffer, ForwardKeyCell> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_buffer::WlBuffer,
        event: c_buffer::Event,
        data: &ForwardKeyCell,
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        if let c_buffer::Event::Release = event {
            let Some(key) = data.get() else { return };
            if let Some(plugin) = state.plugin.as_mut() {
                if let Some(buffer) = plugin.forward.buffers.get(&key) {
                    if buffer.downstream.is_alive() {
                        buffer.downstream.release();
                    }
                }
            }
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_version_caps_at_supported() {
        assert_eq!(clamp_version(Some(9), 5), Some(5));
        assert_eq!(clamp_version(Some(3), 5), Some(3));
    }

    #[test]
    fn test_clamp_version_missing_upstream() {
        assert_eq!(clamp_version(None, 5), None);
    }

    #[test]
    fn test_forward_keys_unique() {
        let mut fwd = ForwardState::default();
        let a = fwd.alloc_key();
        let b = fwd.alloc_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_cell_set_once() {
        let cell = ForwardKeyCell::new();
        assert_eq!(cell.get(), None);
        cell.set(ForwardKey(7));
        cell.set(ForwardKey(9));
        assert_eq!(cell.get(), Some(ForwardKey(7)));
    }
}
