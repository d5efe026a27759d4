//! wl_compositor / wl_surface forwarding, plus the wl_subcompositor poison
//! global.
//!
//! Surfaces are relayed one to one. Regions are accepted but inert; they
//! only carry optimization hints and the upstream compositor works without
//! them. Subsurfaces are refused outright with a protocol error, which
//! keeps the plugin's scene graph a single surface per output.

use wayland_client::protocol::wl_callback as c_callback;
use wayland_client::protocol::wl_output::Transform;
use wayland_client::protocol::wl_surface as c_surface;
use wayland_server::protocol::{
    wl_callback as s_callback, wl_compositor as s_compositor, wl_region as s_region,
    wl_subcompositor as s_subcompositor, wl_subsurface as s_subsurface, wl_surface as s_surface,
};
use wayland_server::{
    Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum,
};

use crate::core::forward::{ForwardKey, ForwardSurface, StagedAttach};
use crate::core::state::LockState;

impl GlobalDispatch<s_compositor::WlCompositor, ()> for LockState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<s_compositor::WlCompositor, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_compositor::WlCompositor,
        request: s_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        match request {
            s_compositor::Request::CreateSurface { id } => {
                let key = plugin.forward.alloc_key();
                let upstream = state.compositor.create_surface(&state.qh, key);
                let downstream = data_init.init(id, key);
                plugin.forward.surfaces.insert(
                    key,
                    ForwardSurface {
                        downstream,
                        upstream,
                        layer: None,
                    },
                );
            }
            s_compositor::Request::CreateRegion { id } => {
                data_init.init(id, ());
            }
            _ => {}
        }
    }
}

impl Dispatch<s_region::WlRegion, ()> for LockState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &s_region::WlRegion,
        _request: s_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // Regions are inert; add/subtract/destroy need no relay.
    }
}

impl Dispatch<s_surface::WlSurface, ForwardKey> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_surface::WlSurface,
        request: s_surface::Request,
        data: &ForwardKey,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let key = *data;
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(surface) = plugin.forward.surfaces.get_mut(&key) else {
            return;
        };
        match request {
            s_surface::Request::Attach { buffer, x, y } => {
                let buffer_key = buffer.as_ref().and_then(|b| b.data::<ForwardKey>()).copied();
                if let Some(layer) = surface.layer.as_mut() {
                    if !layer.acked {
                        layer.staged_attach = Some(StagedAttach {
                            buffer: buffer_key,
                            x,
                            y,
                        });
                        return;
                    }
                }
                let upstream_buffer = buffer_key
                    .and_then(|k| plugin.forward.buffers.get(&k))
                    .map(|b| b.upstream.clone());
                surface.upstream.attach(upstream_buffer.as_ref(), x, y);
            }
            s_surface::Request::Damage {
                x,
                y,
                width,
                height,
            } => {
                surface.upstream.damage(x, y, width, height);
            }
            s_surface::Request::DamageBuffer {
                x,
                y,
                width,
                height,
            } => {
                surface.upstream.damage_buffer(x, y, width, height);
            }
            s_surface::Request::Frame { callback } => {
                let upstream = surface.upstream.clone();
                let cb_key = plugin.forward.alloc_key();
                let downstream = data_init.init(callback, ());
                plugin.forward.callbacks.insert(cb_key, downstream);
                upstream.frame(&state.qh, cb_key);
            }
            s_surface::Request::Commit => {
                if let Some(layer) = surface.layer.as_mut() {
                    if !layer.acked {
                        layer.staged_commit = true;
                        return;
                    }
                }
                surface.upstream.commit();
            }
            s_surface::Request::SetBufferScale { scale } => {
                surface.upstream.set_buffer_scale(scale);
            }
            s_surface::Request::SetBufferTransform { transform } => {
                if let WEnum::Value(transform) = transform {
                    if let Ok(transform) = Transform::try_from(transform as u32) {
                        surface.upstream.set_buffer_transform(transform);
                    }
                }
            }
            s_surface::Request::Offset { x, y } => {
                surface.upstream.offset(x, y);
            }
            s_surface::Request::SetOpaqueRegion { .. }
            | s_surface::Request::SetInputRegion { .. } => {
                // Regions are not relayed.
            }
            s_surface::Request::Destroy => {
                if let Some(surface) = plugin.forward.surfaces.remove(&key) {
                    surface.upstream.destroy();
                }
                for lock_surface in &mut state.surfaces {
                    let claimed = lock_surface
                        .plugin_child
                        .as_ref()
                        .is_some_and(|c| c.key == key);
                    if claimed {
                        if let Some(child) = lock_surface.plugin_child.take() {
                            child.subsurface.destroy();
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<s_callback::WlCallback, ()> for LockState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &s_callback::WlCallback,
        _request: s_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // wl_callback has no requests.
    }
}

// ===== Subsurface rejection =====

impl GlobalDispatch<s_subcompositor::WlSubcompositor, ()> for LockState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_subcompositor::WlSubcompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<s_subcompositor::WlSubcompositor, ()> for LockState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &s_subcompositor::WlSubcompositor,
        request: s_subcompositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            s_subcompositor::Request::GetSubsurface { id, .. } => {
                data_init.init(id, ());
                resource.post_error(
                    s_subcompositor::Error::BadSurface,
                    "subsurfaces are not supported here",
                );
            }
            _ => {}
        }
    }
}

impl Dispatch<s_subsurface::WlSubsurface, ()> for LockState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &s_subsurface::WlSubsurface,
        _request: s_subsurface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // Unreachable: creation already posted a protocol error.
    }
}

// ===== Upstream relays =====

impl wayland_client::Dispatch<c_surface::WlSurface, ForwardKey> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_surface::WlSurface,
        event: c_surface::Event,
        data: &ForwardKey,
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(surface) = plugin.forward.surfaces.get(data) else {
            return;
        };
        match event {
            c_surface::Event::Enter { output } => {
                for lock_surface in &state.surfaces {
                    if lock_surface.output == output {
                        for downstream in &lock_surface.downstream_outputs {
                            surface.downstream.enter(downstream);
                        }
                    }
                }
            }
            c_surface::Event::Leave { output } => {
                for lock_surface in &state.surfaces {
                    if lock_surface.output == output {
                        for downstream in &lock_surface.downstream_outputs {
                            surface.downstream.leave(downstream);
                        }
                    }
                }
            }
            c_surface::Event::PreferredBufferScale { factor } => {
                if surface.downstream.version() >= 6 {
                    surface.downstream.preferred_buffer_scale(factor);
                }
            }
            c_surface::Event::PreferredBufferTransform { transform } => {
                if surface.downstream.version() >= 6 {
                    if let WEnum::Value(transform) = transform {
                        if let Ok(transform) =
                            wayland_server::protocol::wl_output::Transform::try_from(
                                transform as u32,
                            )
                        {
                            surface.downstream.preferred_buffer_transform(transform);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl wayland_client::Dispatch<c_callback::WlCallback, ForwardKey> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_callback::WlCallback,
        event: c_callback::Event,
        data: &ForwardKey,
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        if let c_callback::Event::Done { callback_data } = event {
            if let Some(plugin) = state.plugin.as_mut() {
                if let Some(downstream) = plugin.forward.callbacks.remove(data) {
                    downstream.done(callback_data);
                }
            }
        }
    }
}
