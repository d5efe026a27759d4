//! linux-dmabuf forwarding.
//!
//! Buffer params and their fds pass through untouched. Format discovery is
//! replayed from whatever the upstream sent us: flat format/modifier events
//! for plugin binds below v4, committed feedback state for v4 and later.
//! Surface feedback is answered with the default feedback; on a lock screen
//! every surface is fullscreen on its output and the distinction carries no
//! information.

use std::os::fd::AsFd;

use wayland_client::protocol::wl_buffer as c_buffer;
use wayland_client::Proxy;
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1 as c_params, zwp_linux_dmabuf_v1 as c_dmabuf,
};
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1 as s_params, zwp_linux_dmabuf_feedback_v1 as s_feedback,
    zwp_linux_dmabuf_v1 as s_dmabuf,
};
use wayland_server::protocol::wl_buffer as s_buffer;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

use crate::core::feedback::FeedbackState;
use crate::core::forward::{ForwardBuffer, ForwardKey, ForwardKeyCell, ParamsLink};
use crate::core::state::LockState;

/// Replay committed feedback state onto one plugin-side feedback resource.
pub fn send_feedback(resource: &s_feedback::ZwpLinuxDmabufFeedbackV1, fb: &FeedbackState) {
    if let Some((fd, size)) = &fb.table {
        resource.format_table(fd.as_fd(), *size);
    }
    resource.main_device(fb.main_device.to_ne_bytes().to_vec());
    for tranche in &fb.tranches {
        resource.tranche_target_device(tranche.device.to_ne_bytes().to_vec());
        let mut indices = Vec::with_capacity(tranche.indices.len() * 2);
        for idx in &tranche.indices {
            indices.extend_from_slice(&idx.to_le_bytes());
        }
        resource.tranche_formats(indices);
        resource.tranche_flags(s_feedback::TrancheFlags::from_bits_truncate(tranche.flags));
        resource.tranche_done();
    }
    resource.done();
}

impl GlobalDispatch<s_dmabuf::ZwpLinuxDmabufV1, ()> for LockState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_dmabuf::ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let dmabuf = data_init.init(resource, ());
        if dmabuf.version() < 4 {
            for &(format, modifier) in &state.feedback.dmabuf_pairs {
                if dmabuf.version() >= 3 {
                    dmabuf.modifier(format, (modifier >> 32) as u32, modifier as u32);
                } else {
                    dmabuf.format(format);
                }
            }
        }
    }
}

impl Dispatch<s_dmabuf::ZwpLinuxDmabufV1, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_dmabuf::ZwpLinuxDmabufV1,
        request: s_dmabuf::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(upstream_dmabuf) = state.dmabuf.as_ref() else {
            return;
        };
        match request {
            s_dmabuf::Request::CreateParams { params_id } => {
                let key = plugin.forward.alloc_key();
                let upstream = upstream_dmabuf.create_params(&state.qh, key);
                let downstream = data_init.init(params_id, key);
                plugin
                    .forward
                    .params
                    .insert(key, ParamsLink { downstream, upstream });
            }
            s_dmabuf::Request::GetDefaultFeedback { id }
            | s_dmabuf::Request::GetSurfaceFeedback { id, .. } => {
                let feedback = data_init.init(id, ());
                if state.feedback.has_feedback() {
                    send_feedback(&feedback, state.feedback.current());
                }
                plugin.forward.feedback_listeners.push(feedback);
            }
            s_dmabuf::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<s_feedback::ZwpLinuxDmabufFeedbackV1, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &s_feedback::ZwpLinuxDmabufFeedbackV1,
        request: s_feedback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let s_feedback::Request::Destroy = request {
            if let Some(plugin) = state.plugin.as_mut() {
                plugin.forward.feedback_listeners.retain(|f| f != resource);
            }
        }
    }
}

impl Dispatch<s_params::ZwpLinuxBufferParamsV1, ForwardKey> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_params::ZwpLinuxBufferParamsV1,
        request: s_params::Request,
        data: &ForwardKey,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(link) = plugin.forward.params.get(data) else {
            return;
        };
        match request {
            s_params::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                link.upstream
                    .add(fd.as_fd(), plane_idx, offset, stride, modifier_hi, modifier_lo);
            }
            s_params::Request::Create {
                width,
                height,
                format,
                flags,
            } => {
                let WEnum::Value(flags) = flags else { return };
                let flags = c_params::Flags::from_bits_truncate(flags.bits());
                link.upstream.create(width, height, format, flags);
            }
            s_params::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags,
            } => {
                let WEnum::Value(flags) = flags else { return };
                let flags = c_params::Flags::from_bits_truncate(flags.bits());
                let upstream_params = link.upstream.clone();
                let key = plugin.forward.alloc_key();
                let cell = ForwardKeyCell::new();
                cell.set(key);
                let upstream =
                    upstream_params.create_immed(width, height, format, flags, &state.qh, cell);
                let downstream = data_init.init(buffer_id, key);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream });
            }
            s_params::Request::Destroy => {
                if let Some(link) = plugin.forward.params.remove(data) {
                    link.upstream.destroy();
                }
            }
            _ => {}
        }
    }
}

// ===== Upstream relays =====

impl wayland_client::Dispatch<c_params::ZwpLinuxBufferParamsV1, ForwardKey> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_params::ZwpLinuxBufferParamsV1,
        event: c_params::Event,
        data: &ForwardKey,
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let handle = plugin.handle.clone();
        let Some(link) = plugin.forward.params.get(data) else {
            return;
        };
        match event {
            c_params::Event::Created { buffer } => {
                let downstream_params = link.downstream.clone();
                let key = plugin.forward.alloc_key();
                if let Some(cell) = buffer.data::<ForwardKeyCell>() {
                    cell.set(key);
                }
                let Some(client) = downstream_params.client() else {
                    buffer.destroy();
                    return;
                };
                let downstream: s_buffer::WlBuffer = match client.create_resource::<s_buffer::WlBuffer, ForwardKey, LockState>(
                    &handle,
                    1,
                    key,
                ) {
                    Ok(resource) => resource,
                    Err(e) => {
                        tracing::warn!("failed to mint plugin buffer: {e}");
                        buffer.destroy();
                        return;
                    }
                };
                downstream_params.created(&downstream);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream: buffer });
            }
            c_params::Event::Failed => {
                link.downstream.failed();
            }
            _ => {}
        }
    }

    wayland_client::event_created_child!(LockState, c_params::ZwpLinuxBufferParamsV1, [
        c_params::EVT_CREATED_OPCODE => (c_buffer::WlBuffer, ForwardKeyCell::new()),
    ]);
}

impl wayland_client::Dispatch<c_dmabuf::ZwpLinuxDmabufV1, ()> for LockState {
    fn event(
        state: &mut Self,
        _proxy: &c_dmabuf::ZwpLinuxDmabufV1,
        event: c_dmabuf::Event,
        _data: &(),
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
    ) {
        match event {
            c_dmabuf::Event::Format { format } => {
                state.feedback.dmabuf_pairs.push((format, 0));
            }
            c_dmabuf::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => {
                let modifier = ((modifier_hi as u64) << 32) | modifier_lo as u64;
                state.feedback.dmabuf_pairs.push((format, modifier));
            }
            _ => {}
        }
    }
}
