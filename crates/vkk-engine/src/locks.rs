//! The engine's lock set.
//!
//! Five independent locks map onto Vulkan's externally synchronized
//! parameters. Each lock guards the state it protects, so holding the guard
//! is the only way to reach that state, and functions with a `_locked`
//! suffix take the guard as proof.
//!
//! | Lock        | Protects                                                   |
//! |-------------|------------------------------------------------------------|
//! | `cmd`       | the shared command pool, its command buffers and recording  |
//! | `usf`       | uniform set factory pools, set allocation, reference counts |
//! | `utility`   | shader module and sampler caches                            |
//! | `renderer`  | queue submission/wait-idle and frame retirement state       |
//! | `renderer_cond` | wakes waiters when a frame serial retires             |
//!
//! Acquisition order when nesting is unavoidable: `utility`, `usf`, `cmd`,
//! `renderer`. No code path holds two of them today.

use crate::uniform::UsfState;
use crate::utility::UtilityCaches;
use ash::vk;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;

/// State behind the `cmd` lock.
#[derive(Debug)]
pub struct CmdState {
    pub(crate) pool: vk::CommandPool,
}

impl CmdState {
    /// The engine's shared command pool.
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }
}

/// State behind the `renderer` lock.
///
/// Frame serials are issued engine-wide, starting at 1. Each registered
/// renderer publishes the oldest serial it still needs (recording or
/// pending on the GPU); everything below the minimum has retired.
#[derive(Debug)]
pub struct RendererState {
    expired: u64,
    next_serial: u64,
    next_renderer: u64,
    needed: BTreeMap<u64, u64>,
    shutdown: bool,
}

impl Default for RendererState {
    fn default() -> Self {
        Self {
            expired: 0,
            next_serial: 1,
            next_renderer: 0,
            needed: BTreeMap::new(),
            shutdown: false,
        }
    }
}

impl RendererState {
    /// Highest frame serial known to have retired on the GPU.
    pub fn expired(&self) -> u64 {
        self.expired
    }

    /// Serial the next frame will get.
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Whether the renderer side has shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Raise `expired` to what the registered renderers allow. Returns
    /// whether it moved.
    fn recompute(&mut self) -> bool {
        let retired = match self.needed.values().min() {
            Some(&oldest) => oldest - 1,
            None => self.next_serial - 1,
        };
        if retired > self.expired {
            self.expired = retired;
            true
        } else {
            false
        }
    }
}

/// Guard for the `cmd` lock.
pub type CmdGuard<'a> = MutexGuard<'a, CmdState>;
/// Guard for the `usf` lock.
pub type UsfGuard<'a> = MutexGuard<'a, UsfState>;
/// Guard for the `utility` lock.
pub type UtilityGuard<'a> = MutexGuard<'a, UtilityCaches>;
/// Guard for the `renderer` lock.
pub type RendererGuard<'a> = MutexGuard<'a, RendererState>;

/// The engine's five locks.
pub struct EngineLocks {
    cmd: Mutex<CmdState>,
    usf: Mutex<UsfState>,
    utility: Mutex<UtilityCaches>,
    renderer: Mutex<RendererState>,
    renderer_cond: Condvar,
}

impl EngineLocks {
    pub(crate) fn new(command_pool: vk::CommandPool) -> Self {
        Self {
            cmd: Mutex::new(CmdState { pool: command_pool }),
            usf: Mutex::new(UsfState::default()),
            utility: Mutex::new(UtilityCaches::default()),
            renderer: Mutex::new(RendererState::default()),
            renderer_cond: Condvar::new(),
        }
    }

    /// Lock the shared command pool.
    pub fn cmd_lock(&self) -> CmdGuard<'_> {
        self.cmd.lock()
    }

    /// Lock uniform set factory state.
    pub fn usf_lock(&self) -> UsfGuard<'_> {
        self.usf.lock()
    }

    /// Lock the shader module and sampler caches.
    pub fn utility_lock(&self) -> UtilityGuard<'_> {
        self.utility.lock()
    }

    /// Lock queue access and renderer state.
    pub fn renderer_lock(&self) -> RendererGuard<'_> {
        self.renderer.lock()
    }

    /// Wake every thread blocked in [`EngineLocks::renderer_wait`].
    pub fn renderer_signal(&self) {
        self.renderer_cond.notify_all();
    }

    /// Release the renderer lock until signaled, then reacquire it.
    pub fn renderer_wait(&self, guard: &mut RendererGuard<'_>) {
        self.renderer_cond.wait(guard);
    }

    /// Block until frame serial `ts` has retired or the renderer shut down.
    pub fn renderer_wait_for_timestamp(&self, ts: u64) {
        let mut guard = self.renderer_lock();
        while !guard.shutdown && guard.expired < ts {
            self.renderer_wait(&mut guard);
        }
    }

    /// Record that every frame up to `ts` has retired.
    pub fn renderer_expire(&self, ts: u64) {
        let mut guard = self.renderer_lock();
        if ts > guard.expired {
            guard.expired = ts;
            drop(guard);
            self.renderer_signal();
        }
    }

    /// Register a renderer on the frame timeline.
    pub(crate) fn renderer_register(&self) -> u64 {
        let mut guard = self.renderer_lock();
        guard.next_renderer += 1;
        guard.next_renderer
    }

    /// Issue the next frame serial to `renderer`, which still needs
    /// `oldest_pending` (if any) and the new frame.
    pub(crate) fn renderer_begin(&self, renderer: u64, oldest_pending: Option<u64>) -> u64 {
        let mut guard = self.renderer_lock();
        let serial = guard.next_serial;
        guard.next_serial += 1;
        guard
            .needed
            .insert(renderer, oldest_pending.unwrap_or(serial).min(serial));
        serial
    }

    /// Publish the oldest serial `renderer` still needs, or `None` once all
    /// of its frames have retired, and wake waiters if frames expired.
    pub(crate) fn renderer_retire(&self, renderer: u64, oldest_needed: Option<u64>) {
        let mut guard = self.renderer_lock();
        match oldest_needed {
            Some(serial) => {
                guard.needed.insert(renderer, serial);
            }
            None => {
                guard.needed.remove(&renderer);
            }
        }
        if guard.recompute() {
            drop(guard);
            self.renderer_signal();
        }
    }

    /// Mark the renderer side shut down and release all waiters.
    pub(crate) fn renderer_shutdown(&self) {
        let mut guard = self.renderer_lock();
        guard.shutdown = true;
        guard.expired = u64::MAX;
        drop(guard);
        self.renderer_signal();
    }
}
