//! Plugin-facing output mirroring.
//!
//! One wl_output global per lock output, carrying the upstream values
//! verbatim so the plugin can size its buffers correctly. xdg-output is
//! answered from the same cache. The global's user data is the upstream
//! registry name, which is also how layer surfaces pick their output.

use wayland_protocols::xdg::xdg_output::zv1::server::{
    zxdg_output_manager_v1 as s_xdg_manager, zxdg_output_v1 as s_xdg_output,
};
use wayland_server::protocol::wl_output as s_output;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::core::state::LockState;
use crate::core::surface::LockSurface;

pub fn send_output_info(surface: &LockSurface, resource: &s_output::WlOutput) {
    if let Some(geo) = &surface.info.geometry {
        let subpixel = s_output::Subpixel::try_from(geo.subpixel)
            .unwrap_or(s_output::Subpixel::Unknown);
        let transform = s_output::Transform::try_from(geo.transform)
            .unwrap_or(s_output::Transform::Normal);
        resource.geometry(
            geo.x,
            geo.y,
            geo.physical_width,
            geo.physical_height,
            subpixel,
            geo.make.clone(),
            geo.model.clone(),
            transform,
        );
    }
    if let Some((width, height, refresh)) = surface.info.mode {
        resource.mode(s_output::Mode::Current, width, height, refresh);
    }
    if resource.version() >= 2 {
        resource.scale(surface.info.scale);
    }
    if resource.version() >= 4 {
        if let Some(name) = &surface.info.name {
            resource.name(name.clone());
        }
        if let Some(description) = &surface.info.description {
            resource.description(description.clone());
        }
    }
    if resource.version() >= 2 {
        resource.done();
    }
}

fn send_xdg_output_info(surface: &LockSurface, resource: &s_xdg_output::ZxdgOutputV1) {
    let (x, y) = surface
        .info
        .geometry
        .as_ref()
        .map(|g| (g.x, g.y))
        .unwrap_or((0, 0));
    resource.logical_position(x, y);
    if let Some((width, height, _)) = surface.info.mode {
        let scale = surface.info.scale.max(1);
        resource.logical_size(width / scale, height / scale);
    }
    if resource.version() == 2 {
        if let Some(name) = &surface.info.name {
            resource.name(name.clone());
        }
        if let Some(description) = &surface.info.description {
            resource.description(description.clone());
        }
    }
    // From v3 on, completeness is signalled through wl_output.done.
    if resource.version() < 3 {
        resource.done();
    }
}

/// Re-send cached output state to every plugin resource mirroring it.
pub fn broadcast_output_info(state: &LockState, output_name: u32) {
    let Some(surface) = state.surfaces.iter().find(|s| s.output_name == output_name) else {
        return;
    };
    for resource in &surface.downstream_outputs {
        send_output_info(surface, resource);
    }
    for resource in &surface.downstream_xdg_outputs {
        send_xdg_output_info(surface, resource);
    }
}

impl GlobalDispatch<s_output::WlOutput, u32> for LockState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_output::WlOutput>,
        global_data: &u32,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let output_name = *global_data;
        let resource = data_init.init(resource, output_name);
        if let Some(surface) = state
            .surfaces
            .iter_mut()
            .find(|s| s.output_name == output_name)
        {
            send_output_info(surface, &resource);
            surface.downstream_outputs.push(resource);
        }
    }
}

impl Dispatch<s_output::WlOutput, u32> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &s_output::WlOutput,
        request: s_output::Request,
        data: &u32,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let s_output::Request::Release = request {
            if let Some(surface) = state.surfaces.iter_mut().find(|s| s.output_name == *data) {
                surface.downstream_outputs.retain(|o| o != resource);
            }
        }
    }
}

impl GlobalDispatch<s_xdg_manager::ZxdgOutputManagerV1, ()> for LockState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_xdg_manager::ZxdgOutputManagerV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<s_xdg_manager::ZxdgOutputManagerV1, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_xdg_manager::ZxdgOutputManagerV1,
        request: s_xdg_manager::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            s_xdg_manager::Request::GetXdgOutput { id, output } => {
                let output_name = output.data::<u32>().copied().unwrap_or(0);
                let resource = data_init.init(id, output_name);
                if let Some(surface) = state
                    .surfaces
                    .iter_mut()
                    .find(|s| s.output_name == output_name)
                {
                    send_xdg_output_info(surface, &resource);
                    if resource.version() >= 3 {
                        for downstream in &surface.downstream_outputs {
                            if downstream.version() >= 2 {
                                downstream.done();
                            }
                        }
                    }
                    surface.downstream_xdg_outputs.push(resource);
                }
            }
            s_xdg_manager::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<s_xdg_output::ZxdgOutputV1, u32> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &s_xdg_output::ZxdgOutputV1,
        request: s_xdg_output::Request,
        data: &u32,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let s_xdg_output::Request::Destroy = request {
            if let Some(surface) = state.surfaces.iter_mut().find(|s| s.output_name == *data) {
                surface.downstream_xdg_outputs.retain(|o| o != resource);
            }
        }
    }
}
