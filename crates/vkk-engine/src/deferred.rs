//! Deferred object destruction.
//!
//! Dropping an engine object does not destroy its Vulkan handles. The handles
//! are packed into an [`Object`] and handed to [`Engine::delete_object`],
//! which queues them for the `vkk-destruct` worker. The worker waits until the
//! last frame that used the object has retired, then destroys it. After
//! engine shutdown the queue is gone and objects are destroyed inline.
//!
//! [`Engine::delete_object`]: crate::Engine::delete_object

use crate::buffer::BufferResources;
use crate::compute::ComputeResources;
use crate::engine::Core;
use crate::image::ImageResources;
use crate::pipeline::{PipelineLayoutResources, PipelineResources};
use crate::renderer::RendererResources;
use crate::uniform::{FactoryRelease, UniformSetResources};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Kind of a deletable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Image,
    UniformSet,
    UniformSetFactory,
    PipelineLayout,
    GraphicsPipeline,
    ComputePipeline,
    Renderer,
    Compute,
}

/// An object released by its owner, waiting to be destroyed.
pub enum Object {
    Buffer(BufferResources),
    Image(ImageResources),
    UniformSet(UniformSetResources),
    UniformSetFactory(FactoryRelease),
    PipelineLayout(PipelineLayoutResources),
    GraphicsPipeline(PipelineResources),
    ComputePipeline(PipelineResources),
    Renderer(RendererResources),
    Compute(ComputeResources),
}

impl Object {
    /// The object's kind.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Buffer(_) => ObjectKind::Buffer,
            Self::Image(_) => ObjectKind::Image,
            Self::UniformSet(_) => ObjectKind::UniformSet,
            Self::UniformSetFactory(_) => ObjectKind::UniformSetFactory,
            Self::PipelineLayout(_) => ObjectKind::PipelineLayout,
            Self::GraphicsPipeline(_) => ObjectKind::GraphicsPipeline,
            Self::ComputePipeline(_) => ObjectKind::ComputePipeline,
            Self::Renderer(_) => ObjectKind::Renderer,
            Self::Compute(_) => ObjectKind::Compute,
        }
    }

    /// Frame serial of the object's last use; 0 if never used by a frame.
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Buffer(r) => r.ts,
            Self::Image(r) => r.ts,
            Self::UniformSet(r) => r.ts,
            Self::PipelineLayout(r) => r.ts,
            Self::GraphicsPipeline(r) | Self::ComputePipeline(r) => r.ts,
            // Renderers and compute objects wait on their own fences.
            Self::UniformSetFactory(_) | Self::Renderer(_) | Self::Compute(_) => 0,
        }
    }

    /// Destroy the object's Vulkan handles and return its memory.
    ///
    /// # Safety
    /// No pending GPU work may reference the object.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        match self {
            Self::Buffer(r) => r.destroy(core),
            Self::Image(r) => r.destroy(core),
            Self::UniformSet(r) => r.destroy(core),
            Self::UniformSetFactory(r) => r.destroy(core),
            Self::PipelineLayout(r) => r.destroy(core),
            Self::GraphicsPipeline(r) | Self::ComputePipeline(r) => r.destroy(core),
            Self::Renderer(r) => r.destroy(core),
            Self::Compute(r) => r.destroy(core),
        }
    }
}

/// Message to the destructor worker.
enum DestructJob {
    /// Destroy an object once its last frame retires.
    Destroy(Object),
    /// Drain remaining jobs and exit.
    Shutdown,
}

/// Count of queued jobs. Waiters hold their own `Arc` so they never block
/// pushes.
#[derive(Default)]
pub(crate) struct Pending {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every queued object has been destroyed.
    pub(crate) fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Handle to the destructor worker thread.
pub(crate) struct DestructQueue {
    tx: Sender<DestructJob>,
    pending: Arc<Pending>,
    thread: Option<JoinHandle<()>>,
}

impl DestructQueue {
    /// Spawn the worker.
    pub(crate) fn spawn(core: Arc<Core>) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<DestructJob>();
        let pending = Arc::new(Pending::default());

        let thread = {
            let pending = pending.clone();
            thread::Builder::new()
                .name("vkk-destruct".to_string())
                .spawn(move || Self::worker_loop(&core, &rx, &pending))?
        };

        Ok(Self {
            tx,
            pending,
            thread: Some(thread),
        })
    }

    fn worker_loop(core: &Core, rx: &Receiver<DestructJob>, pending: &Pending) {
        loop {
            match rx.recv() {
                Ok(DestructJob::Destroy(object)) => {
                    core.locks.renderer_wait_for_timestamp(object.timestamp());
                    let kind = object.kind();
                    // SAFETY: the object's last frame has retired, or the
                    // renderer has shut down after the device went idle.
                    unsafe { object.destroy(core) };
                    tracing::trace!("destroyed {kind:?}");
                    pending.done();
                }
                Ok(DestructJob::Shutdown) | Err(_) => return,
            }
        }
    }

    /// Queue an object, handing it back if the worker is gone.
    pub(crate) fn push(&self, object: Object) -> Result<(), Object> {
        self.pending.add();
        match self.tx.send(DestructJob::Destroy(object)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.pending.done();
                match err.into_inner() {
                    DestructJob::Destroy(object) => Err(object),
                    DestructJob::Shutdown => unreachable!("only objects are pushed"),
                }
            }
        }
    }

    /// The job counter, to wait on without holding the queue.
    pub(crate) fn pending(&self) -> Arc<Pending> {
        self.pending.clone()
    }

    /// Process every queued job, then stop the worker.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.tx.send(DestructJob::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("destructor worker panicked");
            }
        }
    }
}

impl Drop for DestructQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
