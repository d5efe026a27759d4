//! Central locker state.
//!
//! One `LockState` is threaded through every event-loop callback: upstream
//! display events, plugin server dispatch, verifier completion, and timers
//! all mutate it from the same thread. There is no locking anywhere; the
//! event loop is the synchronization.

use std::collections::HashMap;

use anyhow::{Context, Result};
use calloop::{LoopHandle, RegistrationToken};
use wayland_client::globals::GlobalList;
use wayland_client::protocol::{wl_compositor, wl_shm, wl_subcompositor};
use wayland_client::QueueHandle;
use wayland_protocols::ext::session_lock::v1::client::{
    ext_session_lock_manager_v1::ExtSessionLockManagerV1, ext_session_lock_v1::ExtSessionLockV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;

use crate::config::Config;
use crate::core::auth::{Auth, Verifier};
use crate::core::feedback::FeedbackSync;
use crate::core::forward::drm::DrmInfo;
use crate::core::server::PluginServer;
use crate::core::surface::{BackgroundPainter, LockSurface, SolidPainter};
use crate::core::upstream::seat::KeyboardState;
use crate::protocols::wl_drm::client::wl_drm::WlDrm;

/// Timer registrations that need cancelling/rescheduling.
#[derive(Default)]
pub struct Timers {
    pub indicator_clear: Option<RegistrationToken>,
    pub password_clear: Option<RegistrationToken>,
}

pub struct LockState {
    pub qh: QueueHandle<LockState>,
    pub loop_handle: LoopHandle<'static, LockState>,
    pub config: Config,

    // Upstream globals.
    pub compositor: wl_compositor::WlCompositor,
    pub subcompositor: Option<wl_subcompositor::WlSubcompositor>,
    pub shm: wl_shm::WlShm,
    pub lock_manager: ExtSessionLockManagerV1,
    pub dmabuf: Option<ZwpLinuxDmabufV1>,
    pub drm: Option<WlDrm>,
    pub drm_info: DrmInfo,
    /// Interface name to advertised version, from the initial registry
    /// snapshot. Used to clamp what the plugin server advertises.
    pub upstream_versions: HashMap<String, u32>,

    // Session lock.
    pub lock: Option<ExtSessionLockV1>,
    pub locked: bool,

    pub surfaces: Vec<LockSurface>,
    pub keyboard: KeyboardState,
    pub painter: SolidPainter,

    pub auth: Auth,
    pub verifier: Verifier,
    pub feedback: FeedbackSync,
    pub plugin: Option<PluginServer>,

    pub timers: Timers,
    pub running: bool,
}

impl LockState {
    pub fn new(
        globals: &GlobalList,
        qh: QueueHandle<LockState>,
        loop_handle: LoopHandle<'static, LockState>,
        config: Config,
        verifier: Verifier,
    ) -> Result<Self> {
        let mut upstream_versions = HashMap::new();
        for global in globals.contents().clone_list() {
            upstream_versions.insert(global.interface, global.version);
        }

        let compositor: wl_compositor::WlCompositor = globals
            .bind(&qh, 4..=6, ())
            .context("compositor has no wl_compositor")?;
        let subcompositor = globals.bind(&qh, 1..=1, ()).ok();
        let shm: wl_shm::WlShm = globals
            .bind(&qh, 1..=1, ())
            .context("compositor has no wl_shm")?;
        let lock_manager: ExtSessionLockManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .context("compositor does not support ext-session-lock-v1")?;
        let dmabuf: Option<ZwpLinuxDmabufV1> = globals.bind(&qh, 3..=5, ()).ok();
        let drm: Option<WlDrm> = globals.bind(&qh, 1..=2, ()).ok();

        if let Some(dmabuf) = dmabuf.as_ref() {
            use wayland_client::Proxy;
            if dmabuf.version() >= 4 {
                // v4 replaces the flat format/modifier events with the
                // table-based feedback object; track the default feedback.
                dmabuf.get_default_feedback(&qh, ());
            }
        }

        let painter = SolidPainter::new(config.color);
        let auth = Auth::new(config.ignore_empty);

        Ok(Self {
            qh,
            loop_handle,
            config,
            compositor,
            subcompositor,
            shm,
            lock_manager,
            dmabuf,
            drm,
            drm_info: DrmInfo::default(),
            upstream_versions,
            lock: None,
            locked: false,
            surfaces: Vec::new(),
            keyboard: KeyboardState::new(),
            painter,
            auth,
            verifier,
            feedback: FeedbackSync::new(),
            plugin: None,
            timers: Timers::default(),
            running: true,
        })
    }

    pub fn upstream_version(&self, interface: &str) -> Option<u32> {
        self.upstream_versions.get(interface).copied()
    }

    /// Create lock surfaces for every output that does not have one yet.
    /// Called once the `locked` event arrives and again whenever an output
    /// appears while locked.
    pub fn ensure_lock_surfaces(&mut self) {
        if !self.locked {
            return;
        }
        let Some(lock) = self.lock.clone() else {
            return;
        };
        let qh = self.qh.clone();
        for surface in &mut self.surfaces {
            surface.ensure_lock_surface(&lock, &self.compositor, &qh);
        }
    }

    /// Begin unlock/teardown: tell the compositor, then wind the loop down.
    pub fn unlock(&mut self) {
        tracing::info!("credential accepted, unlocking");
        if let Some(lock) = self.lock.take() {
            lock.unlock_and_destroy();
        }
        self.locked = false;
        self.running = false;
    }

    /// Repaint every configured surface with the solid background. The
    /// plugin's layer sits on top of this fallback, so a plugin teardown
    /// instantly falls back to the configured color.
    pub fn render_all(&mut self) {
        for surface in &mut self.surfaces {
            if surface.configured {
                if let Err(e) = self.painter.paint(&self.shm, &self.qh, surface) {
                    tracing::warn!("painting output {} failed: {e}", surface.output_name);
                }
            }
        }
        if self.config.show_failed_attempts && self.auth.failed_attempts > 0 {
            tracing::info!("failed attempts: {}", self.auth.failed_attempts);
        }
        if self.keyboard.caps_lock_active() {
            tracing::info!("caps lock is active");
        }
    }
}
