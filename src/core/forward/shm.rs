//! wl_shm forwarding.
//!
//! Pool fds pass straight through to the upstream compositor; the proxy
//! never maps them. Supported pixel formats are the ones the upstream
//! advertised, replayed verbatim at bind time.

use std::os::fd::AsFd;

use wayland_client::protocol::wl_shm as c_shm;
use wayland_server::protocol::{wl_shm as s_shm, wl_shm_pool as s_shm_pool};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, WEnum};

use crate::core::forward::{ForwardBuffer, ForwardKey, ForwardKeyCell};
use crate::core::state::LockState;

impl GlobalDispatch<s_shm::WlShm, ()> for LockState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<s_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        for &raw in &state.feedback.shm_formats {
            if let Ok(format) = s_shm::Format::try_from(raw) {
                shm.format(format);
            }
        }
    }
}

impl Dispatch<s_shm::WlShm, ()> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_shm::WlShm,
        request: s_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        match request {
            s_shm::Request::CreatePool { id, fd, size } => {
                let key = plugin.forward.alloc_key();
                let upstream = state.shm.create_pool(fd.as_fd(), size, &state.qh, ());
                data_init.init(id, key);
                plugin.forward.pools.insert(key, upstream);
            }
            _ => {}
        }
    }
}

impl Dispatch<s_shm_pool::WlShmPool, ForwardKey> for LockState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &s_shm_pool::WlShmPool,
        request: s_shm_pool::Request,
        data: &ForwardKey,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(plugin) = state.plugin.as_mut() else {
            return;
        };
        let Some(pool) = plugin.forward.pools.get(data) else {
            return;
        };
        match request {
            s_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let WEnum::Value(format) = format else {
                    return;
                };
                let Ok(format) = c_shm::Format::try_from(format as u32) else {
                    return;
                };
                let pool = pool.clone();
                let key = plugin.forward.alloc_key();
                let cell = ForwardKeyCell::new();
                cell.set(key);
                let upstream =
                    pool.create_buffer(offset, width, height, stride, format, &state.qh, cell);
                let downstream = data_init.init(id, key);
                plugin
                    .forward
                    .buffers
                    .insert(key, ForwardBuffer { downstream, upstream });
            }
            s_shm_pool::Request::Resize { size } => {
                pool.resize(size);
            }
            s_shm_pool::Request::Destroy => {
                if let Some(pool) = plugin.forward.pools.remove(data) {
                    pool.destroy();
                }
            }
            _ => {}
        }
    }
}
