//! Legacy wl_drm forwarding.
//!
//! Mesa still probes wl_drm on some drivers before falling back to
//! linux-dmabuf, so the plugin gets a relayed copy whenever the upstream
//! compositor offers one. Device name, formats and capabilities are cached
//! for replay to late binds.

use std::os::fd::AsFd;

use wayland_server::protocol::wl_buffer as s_buffer;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::core::forward::{ForwardBuffer, ForwardKey, ForwardKeyCell};
use crate::core::state::LockState;
use crate::protocols::wl_drm::client::wl_drm as c_drm;
use crate::protocols::wl_drm::server::wl_drm as s_drm;

/// Cached upstream wl_drm announcements.
#[derive(Default)]
pub struct DrmInfo {
    pub device: Option<String>,
    pub formats: Vec<u32>,
    pub capabilities: Option<u32>,
    pub authenticated: bool,
}

impl GlobalDispatch<s_drm::WlDrm, ()> for LockState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_drm::WlDrm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let drm = data_init.init(resource, ());
        if let Some(device) = &state.drm_info.device {
            drm.device(device.clone());
        }
        for &format in &state.drm_info.formats {
            drm.format(format);
        }
        if drm.version() >= 2 {
            if let Some(value) = state.drm_info.capabilities {
                drm.capabilities(value);
            }
        }
        if state.drm_info.authenticated {
            drm.authenticated();
        }
        if let Some(plugin) = state.plugin.as_mut() {
            plugin.forward.drm_resources.push(drm);
        }
    }
}

impl Dispatch<s_drm::WlDrm, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_drm::WlDrm,
        request: s_drm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(upstream_drm) = state.drm.as_ref() else {
            return;
        };
        match request {
            s_drm::Request::Authenticate { id } => {
                upstream_drm.authenticate(id);
            }
            s_drm::Request::CreateBuffer {
                id,
                name,
                width,
                height,
                stride,
                format,
            } => {
                let key = plugin.forward.alloc_key();
                let cell = ForwardKeyCell::new();
                cell.set(key);
                let upstream =
                    upstream_drm.create_buffer(name, width, height, stride, format, &state.qh, cell);
                let downstream = data_init.init(id, key);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream });
            }
            s_drm::Request::CreatePlanarBuffer {
                id,
                name,
                width,
                height,
                format,
                offset0,
                stride0,
                offset1,
                stride1,
                offset2,
                stride2,
            } => {
                let key = plugin.forward.alloc_key();
                let cell = ForwardKeyCell::new();
                cell.set(key);
                let upstream = upstream_drm.create_planar_buffer(
                    name, width, height, format, offset0, stride0, offset1, stride1, offset2,
                    stride2, &state.qh, cell,
                );
                let downstream = data_init.init(id, key);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream });
            }
            s_drm::Request::CreatePrimeBuffer {
                id,
                name,
                width,
                height,
                format,
                offset0,
                stride0,
                offset1,
                stride1,
                offset2,
                stride2,
            } => {
                let key = plugin.forward.alloc_key();
                let cell = ForwardKeyCell::new();
                cell.set(key);
                let upstream = upstream_drm.create_prime_buffer(
                    name.as_fd(),
                    width,
                    height,
                    format,
                    offset0,
                    stride0,
                    offset1,
                    stride1,
                    offset2,
                    stride2,
                    &state.qh,
                    cell,
                );
                let downstream = data_init.init(id, key);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream });
            }
        }
    }
}

// ===== Upstream relay =====

impl wayland_client::Dispatch<c_drm::WlDrm, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_drm::WlDrm,
        event: c_drm::Event,
        _data: &(),
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        let listeners: Vec<s_drm::WlDrm> = state
            .plugin
            .as_ref()
            .map(|p| p.forward.drm_resources.clone())
            .unwrap_or_default();
        match event {
            c_drm::Event::Device { name } => {
                for drm in &listeners {
                    drm.device(name.clone());
                }
                state.drm_info.device = Some(name);
            }
            c_drm::Event::Format { format } => {
                state.drm_info.formats.push(format);
                for drm in &listeners {
                    drm.format(format);
                }
            }
            c_drm::Event::Authenticated => {
                state.drm_info.authenticated = true;
                for drm in &listeners {
                    drm.authenticated();
                }
            }
            c_drm::Event::Capabilities { value } => {
                state.drm_info.capabilities = Some(value);
                for drm in &listeners {
                    if drm.version() >= 2 {
                        drm.capabilities(value);
                    }
                }
            }
        }
    }
}
