//! Per-output lock surfaces and the fallback background painter.
//!
//! One `LockSurface` exists per upstream output: it owns the upstream
//! wl_surface, the ext-session-lock surface role, and the host-side
//! placement of the plugin's surface once a plugin claims the output
//! (a desynchronized subsurface over the lock surface). Surfaces are
//! created when an output appears and destroyed with it.

use std::os::fd::{AsFd, OwnedFd};

use wayland_backend::server::GlobalId;
use wayland_client::protocol::{wl_buffer, wl_compositor, wl_output, wl_shm, wl_subsurface, wl_surface};
use wayland_client::QueueHandle;
use wayland_protocols::ext::session_lock::v1::client::{
    ext_session_lock_surface_v1::ExtSessionLockSurfaceV1, ext_session_lock_v1::ExtSessionLockV1,
};
use wayland_protocols::xdg::xdg_output::zv1::server::zxdg_output_v1::ZxdgOutputV1;
use wayland_server::protocol::wl_output as srv_output;

use crate::core::errors::{LockError, Result};
use crate::core::forward::ForwardKey;
use crate::core::state::LockState;

/// Cached upstream output state, replayed verbatim to every plugin-facing
/// wl_output resource. Enum arguments are kept as raw wire values.
#[derive(Clone, Default)]
pub struct OutputInfo {
    pub geometry: Option<OutputGeometry>,
    /// Current mode as (width, height, refresh).
    pub mode: Option<(i32, i32, i32)>,
    pub scale: i32,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct OutputGeometry {
    pub x: i32,
    pub y: i32,
    pub physical_width: i32,
    pub physical_height: i32,
    pub subpixel: u32,
    pub make: String,
    pub model: String,
    pub transform: u32,
}

/// Host-side record of the plugin surface claiming this output.
pub struct PluginChild {
    pub key: ForwardKey,
    /// Desynchronized subsurface stacking the plugin surface over the
    /// solid fallback.
    pub subsurface: wl_subsurface::WlSubsurface,
}

/// Per-output lock surface.
pub struct LockSurface {
    /// Upstream registry name of the output; stable identity for maps and
    /// for the plugin-facing wl_output global.
    pub output_name: u32,
    pub output: wl_output::WlOutput,
    pub surface: Option<wl_surface::WlSurface>,
    pub lock_surface: Option<ExtSessionLockSurfaceV1>,

    /// Dimensions from the latest lock-surface configure.
    pub width: u32,
    pub height: u32,
    pub info: OutputInfo,

    pub configured: bool,

    /// Set once the plugin requests a layer surface for this output.
    pub plugin_child: Option<PluginChild>,

    /// Plugin-facing wl_output global mirroring this output.
    pub downstream_global: Option<GlobalId>,
    pub downstream_outputs: Vec<srv_output::WlOutput>,
    pub downstream_xdg_outputs: Vec<ZxdgOutputV1>,
}

impl LockSurface {
    pub fn new(output_name: u32, output: wl_output::WlOutput) -> Self {
        Self {
            output_name,
            output,
            surface: None,
            lock_surface: None,
            width: 0,
            height: 0,
            info: OutputInfo {
                scale: 1,
                ..Default::default()
            },
            configured: false,
            plugin_child: None,
            downstream_global: None,
            downstream_outputs: Vec::new(),
            downstream_xdg_outputs: Vec::new(),
        }
    }

    /// Give this output its lock surface role if it does not have one yet.
    pub fn ensure_lock_surface(
        &mut self,
        lock: &ExtSessionLockV1,
        compositor: &wl_compositor::WlCompositor,
        qh: &QueueHandle<LockState>,
    ) {
        if self.lock_surface.is_some() {
            return;
        }
        let surface = compositor.create_surface(qh, ());
        let lock_surface = lock.get_lock_surface(&surface, &self.output, qh, self.output_name);
        self.surface = Some(surface);
        self.lock_surface = Some(lock_surface);
        tracing::debug!("created lock surface for output {}", self.output_name);
    }

    /// Tear down everything this surface owns upstream. The plugin child's
    /// forwarding state is cleaned up separately by the proxy.
    pub fn destroy(&mut self) {
        if let Some(child) = self.plugin_child.take() {
            child.subsurface.destroy();
        }
        if let Some(lock_surface) = self.lock_surface.take() {
            lock_surface.destroy();
        }
        if let Some(surface) = self.surface.take() {
            surface.destroy();
        }
    }
}

// ============================================================================
// Fallback background painter
// ============================================================================

/// Rendering collaborator seam: given a configured surface, draw its
/// background. The built-in implementation fills a single shm buffer with
/// the configured solid color; indicator and image rendering plug in here.
pub trait BackgroundPainter {
    fn paint(
        &mut self,
        shm: &wl_shm::WlShm,
        qh: &QueueHandle<LockState>,
        surface: &mut LockSurface,
    ) -> Result<()>;
}

/// Solid-color painter backed by a throwaway memfd pool.
pub struct SolidPainter {
    /// 0xRRGGBB
    color: u32,
}

impl SolidPainter {
    pub fn new(color: u32) -> Self {
        Self { color }
    }

    fn make_buffer(&self, width: u32, height: u32) -> Result<(OwnedFd, usize)> {
        let stride = width as usize * 4;
        let size = stride * height as usize;
        let fd = nix::sys::memfd::memfd_create(
            c"lockgate-bg",
            nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )
        .map_err(|e| LockError::upstream(format!("memfd_create: {e}")))?;
        let file: std::fs::File = fd.into();
        file.set_len(size as u64)?;

        let mut map = unsafe { memmap2::MmapMut::map_mut(&file)? };
        let pixel = 0xff000000u32 | self.color;
        for chunk in map.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel.to_le_bytes());
        }
        map.flush()?;
        Ok((OwnedFd::from(file), size))
    }
}

impl BackgroundPainter for SolidPainter {
    fn paint(
        &mut self,
        shm: &wl_shm::WlShm,
        qh: &QueueHandle<LockState>,
        surface: &mut LockSurface,
    ) -> Result<()> {
        let (width, height) = (surface.width, surface.height);
        if width == 0 || height == 0 {
            return Ok(());
        }
        let Some(wl_surface) = surface.surface.as_ref() else {
            return Ok(());
        };

        let (fd, size) = self.make_buffer(width, height)?;
        let pool = shm.create_pool(fd.as_fd(), size as i32, qh, ());
        let buffer = pool.create_buffer(
            0,
            width as i32,
            height as i32,
            width as i32 * 4,
            wl_shm::Format::Argb8888,
            qh,
            OwnBuffer,
        );
        // The pool can go away immediately; the buffer keeps the backing
        // storage alive and destroys itself on release.
        pool.destroy();

        wl_surface.attach(Some(&buffer), 0, 0);
        wl_surface.damage_buffer(0, 0, width as i32, height as i32);
        wl_surface.commit();
        Ok(())
    }
}

/// Marker user data for buffers owned by the painter (destroyed on
/// release, as opposed to forwarded buffers which are relayed).
pub struct OwnBuffer;

impl wayland_client::Dispatch<wl_buffer::WlBuffer, OwnBuffer> for LockState {
    fn event(
        _state: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _data: &OwnBuffer,
        _conn: &wayland_client::Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            buffer.destroy();
        }
    }
}
