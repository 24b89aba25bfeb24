//! Bounded-concurrency execution of tile renders.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::stream::{self, Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::render::{RenderOrigin, RenderResult, RenderStrategy, TileRenderer};
use crate::select::TileJob;

/// Something the [`Engine`] can run for each job.
pub trait RenderTile: Send + Sync + 'static {
    /// Renders one tile. Runs on its own tokio task.
    fn render(&self, job: TileJob) -> impl Future<Output = RenderResult> + Send;

    /// Result used when [`render`](RenderTile::render) panics.
    fn fallback(&self, job: &TileJob) -> RenderResult;
}

/// [`TileRenderer`] bound to the strategy of one zoom band.
pub struct BandRenderer {
    renderer: Arc<TileRenderer>,
    strategy: RenderStrategy,
}

impl BandRenderer {
    /// Renders every job with `strategy`.
    #[must_use]
    pub fn new(renderer: Arc<TileRenderer>, strategy: RenderStrategy) -> Self {
        Self { renderer, strategy }
    }
}

impl RenderTile for BandRenderer {
    async fn render(&self, job: TileJob) -> RenderResult {
        self.renderer.render(&job, self.strategy).await
    }

    fn fallback(&self, job: &TileJob) -> RenderResult {
        self.renderer.render_coverage(job, RenderOrigin::Fallback)
    }
}

/// Live counters of an [`Engine`].
#[derive(Debug, Default)]
pub struct EngineStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
    panics: AtomicU64,
}

impl EngineStats {
    /// Renders started and not yet finished or abandoned.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of renders ever in flight at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Renders that produced a result, fallbacks included.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Renders replaced by a fallback because their task failed.
    #[must_use]
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    fn enter(self: &Arc<Self>) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(self))
    }
}

/// Counts a render as in flight until dropped, whether it finished or was abandoned.
struct InFlight(Arc<EngineStats>);

impl InFlight {
    fn complete(self) {
        self.0.completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts the task when the handle is dropped before it finished.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs renders as tokio tasks with bounded concurrency.
///
/// Jobs are pulled from the iterator only when a slot is free, so memory stays
/// proportional to the concurrency rather than to the number of jobs.
pub struct Engine {
    concurrency: usize,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// A concurrency of zero is raised to one.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            stats: Arc::default(),
        }
    }

    /// Maximum renders in flight.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Counters shared by every stream this engine runs.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Renders every job, yielding results in completion order.
    ///
    /// A render that panics is logged and replaced by [`RenderTile::fallback`].
    /// Dropping the stream aborts the renders still in flight.
    pub fn run<R, I>(&self, renderer: Arc<R>, jobs: I) -> impl Stream<Item = RenderResult>
    where
        R: RenderTile,
        I: IntoIterator<Item = TileJob>,
    {
        let stats = Arc::clone(&self.stats);
        stream::iter(jobs)
            .map(move |job| {
                let renderer = Arc::clone(&renderer);
                let stats = Arc::clone(&stats);
                async move {
                    let in_flight = stats.enter();
                    let mut task = {
                        let renderer = Arc::clone(&renderer);
                        let job = job.clone();
                        AbortOnDrop(tokio::spawn(async move { renderer.render(job).await }))
                    };
                    let result = match (&mut task.0).await {
                        Ok(result) => result,
                        Err(e) => {
                            stats.panics.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Rendering {} did not complete, using coverage: {e}", job.coord);
                            renderer.fallback(&job)
                        }
                    };
                    in_flight.complete();
                    result
                }
            })
            .buffer_unordered(self.concurrency)
    }
}
