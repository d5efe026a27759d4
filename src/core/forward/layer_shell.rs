//! Emulated wlr-layer-shell.
//!
//! The plugin believes it is putting a background layer surface on an
//! output. Upstream there is no layer shell while the session is locked;
//! the forwarded surface is placed as a desynchronized subsurface of the
//! host lock surface instead, and configure events are synthesized from
//! the session-lock dimensions. Anchors, margins and exclusive zones are
//! accepted and ignored since the surface always covers the whole output.

use wayland_protocols_wlr::layer_shell::v1::server::{
    zwlr_layer_shell_v1 as s_layer_shell, zwlr_layer_surface_v1 as s_layer_surface,
};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::core::forward::{ForwardKey, LayerRole};
use crate::core::state::LockState;
use crate::core::surface::PluginChild;

impl GlobalDispatch<s_layer_shell::ZwlrLayerShellV1, ()> for LockState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_layer_shell::ZwlrLayerShellV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<s_layer_shell::ZwlrLayerShellV1, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &s_layer_shell::ZwlrLayerShellV1,
        request: s_layer_shell::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            s_layer_shell::Request::GetLayerSurface {
                id,
                surface,
                output,
                ..
            } => {
                let key = surface.data::<ForwardKey>().copied().unwrap_or(ForwardKey(0));
                // Init unconditionally: an error path leaves the resource
                // inert with no role behind it.
                let layer_surface = data_init.init(id, key);

                // Which lock output is being claimed. No output means the
                // plugin takes the first free one.
                let requested = output.as_ref().and_then(|o| o.data::<u32>()).copied();
                let output_name = match requested {
                    Some(name) => Some(name),
                    None => state
                        .surfaces
                        .iter()
                        .find(|s| s.plugin_child.is_none())
                        .map(|s| s.output_name),
                };
                let lock_surface = output_name
                    .and_then(|name| state.surfaces.iter_mut().find(|s| s.output_name == name));
                let Some(lock_surface) = lock_surface else {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "no output available for a layer surface",
                    );
                    return;
                };
                if lock_surface.plugin_child.is_some() {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "output already has a layer surface",
                    );
                    return;
                }
                let Some(host_surface) = lock_surface.surface.clone() else {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "output is not ready for a layer surface",
                    );
                    return;
                };
                let Some(subcompositor) = state.subcompositor.as_ref() else {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "compositor lacks subsurface support",
                    );
                    return;
                };

                let Some(plugin) = state.plugin.as_mut() else {
                    return;
                };
                let Some(fwd_surface) = plugin.forward.surfaces.get_mut(&key) else {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "layer surface on an unknown wl_surface",
                    );
                    return;
                };
                if fwd_surface.layer.is_some() {
                    resource.post_error(
                        s_layer_shell::Error::Role,
                        "surface already has the layer role",
                    );
                    return;
                }

                let subsurface =
                    subcompositor.get_subsurface(&fwd_surface.upstream, &host_surface, &state.qh, ());
                subsurface.set_desync();
                subsurface.set_position(0, 0);
                // The subsurface placement only takes effect with the next
                // parent commit.
                host_surface.commit();

                let mut role = LayerRole {
                    resource: layer_surface,
                    output_name: lock_surface.output_name,
                    last_serial: 0,
                    acked: false,
                    staged_attach: None,
                    staged_commit: false,
                };
                if lock_surface.configured {
                    plugin.forward.serial += 1;
                    role.last_serial = plugin.forward.serial;
                    role.resource
                        .configure(role.last_serial, lock_surface.width, lock_surface.height);
                }
                fwd_surface.layer = Some(role);
                lock_surface.plugin_child = Some(PluginChild { key, subsurface });
                tracing::debug!(
                    "plugin claimed output {} for its background",
                    lock_surface.output_name
                );
            }
            s_layer_shell::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<s_layer_surface::ZwlrLayerSurfaceV1, ForwardKey> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &s_layer_surface::ZwlrLayerSurfaceV1,
        request: s_layer_surface::Request,
        data: &ForwardKey,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let key = *data;
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        match request {
            s_layer_surface::Request::AckConfigure { serial } => {
                let Some(surface) = plugin.forward.surfaces.get_mut(&key) else {
                    return;
                };
                let Some(layer) = surface.layer.as_mut() else {
                    return;
                };
                if serial != layer.last_serial {
                    return;
                }
                if layer.acked {
                    return;
                }
                layer.acked = true;
                // Release whatever the plugin staged before its first ack.
                if let Some(staged) = layer.staged_attach.take() {
                    let upstream_buffer = staged
                        .buffer
                        .and_then(|k| plugin.forward.buffers.get(&k))
                        .map(|b| b.upstream.clone());
                    surface
                        .upstream
                        .attach(upstream_buffer.as_ref(), staged.x, staged.y);
                }
                let flush_commit = layer.staged_commit;
                layer.staged_commit = false;
                if flush_commit {
                    surface.upstream.commit();
                }
            }
            s_layer_surface::Request::GetPopup { .. } => {
                resource.post_error(
                    s_layer_surface::Error::InvalidSurfaceState,
                    "popups are not supported on the lock screen",
                );
            }
            s_layer_surface::Request::Destroy => {
                if let Some(surface) = plugin.forward.surfaces.get_mut(&key) {
                    surface.layer = None;
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
            // Size and placement come from the lock surface; the plugin's
            // wishes are accepted and ignored.
            s_layer_surface::Request::SetSize { .. }
            | s_layer_surface::Request::SetAnchor { .. }
            | s_layer_surface::Request::SetExclusiveZone { .. }
            | s_layer_surface::Request::SetMargin { .. }
            | s_layer_surface::Request::SetKeyboardInteractivity { .. }
            | s_layer_surface::Request::SetLayer { .. } => {}
            _ => {}
        }
    }
}

/// Push the session-lock dimensions to the plugin surface claiming this
/// output, as a synthesized layer-surface configure.
pub fn configure_plugin_child(state: &mut LockState, output_name: u32, width: u32, height: u32) {
    let Some(child_key) = state
        .surfaces
        .iter()
        .find(|s| s.output_name == output_name)
        .and_then(|s| s.plugin_child.as_ref())
        .map(|c| c.key)
    else {
        return;
    };
    let Some(plugin) = state.plugin.as_mut() else {
        return;
    };
    plugin.forward.serial += 1;
    let serial = plugin.forward.serial;
    let Some(surface) = plugin.forward.surfaces.get_mut(&child_key) else {
        return;
    };
    let Some(layer) = surface.layer.as_mut() else {
        return;
    };
    layer.last_serial = serial;
    layer.resource.configure(serial, width, height);
}
