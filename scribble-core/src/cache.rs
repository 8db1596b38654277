use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hf_hub::api::tokio::Api;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{
    ComputeTarget, ControlNetLoader, EdgeDetector, HedLoader, Loader, ModelRepos, SketchError,
    SketchPipeline,
};

/// A lazily loaded, process-lifetime model handle.
///
/// Construction is single-flight: concurrent first callers share one load.
/// The load runs on its own task, so a caller that goes away mid-load does not
/// release the slot to a second construction. A failed load leaves the slot
/// empty, so the next caller starts over.
pub struct ModelSlot<M: ?Sized + 'static> {
    inner: Arc<SlotInner<M>>,
}

struct SlotInner<M: ?Sized + 'static> {
    name: &'static str,
    cell: OnceCell<Arc<M>>,
    loader: Arc<dyn Loader<M>>,
    attempts: AtomicUsize,
}

impl<M: ?Sized + Send + Sync + 'static> SlotInner<M> {
    async fn load_once(&self, target: &ComputeTarget) -> Result<Arc<M>, SketchError> {
        let handle = self
            .cell
            .get_or_try_init(|| async {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                info!(model = self.name, device = target.kind.label(), dtype = ?target.dtype, "loading model");
                let start = Instant::now();
                match self.loader.load(target).await {
                    Ok(handle) => {
                        info!(model = self.name, elapsed = ?start.elapsed(), "model loaded");
                        Ok(handle)
                    }
                    Err(err) => {
                        error!(model = self.name, error = %format!("{err:#}"), "model load failed");
                        Err(SketchError::load(self.name, &err))
                    }
                }
            })
            .await?;
        Ok(Arc::clone(handle))
    }
}

impl<M: ?Sized + Send + Sync + 'static> ModelSlot<M> {
    pub fn new(name: &'static str, loader: Arc<dyn Loader<M>>) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                name,
                cell: OnceCell::new(),
                loader,
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    pub async fn ensure_loaded(&self, target: &ComputeTarget) -> Result<Arc<M>, SketchError> {
        if let Some(handle) = self.inner.cell.get() {
            return Ok(Arc::clone(handle));
        }

        // Dropping the join handle detaches the task; the load keeps the cell's permit.
        let inner = Arc::clone(&self.inner);
        let target = target.clone();
        tokio::spawn(async move { inner.load_once(&target).await })
            .await
            .map_err(|err| {
                SketchError::load(self.inner.name, &anyhow::anyhow!("load task failed: {err}"))
            })?
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.cell.initialized()
    }

    /// Number of constructions started so far, successful or not.
    pub fn load_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

/// Owns the generation pipeline and the edge detector for the whole process.
pub struct ModelCache {
    target: ComputeTarget,
    pipeline: ModelSlot<dyn SketchPipeline>,
    detector: ModelSlot<dyn EdgeDetector>,
}

impl ModelCache {
    pub fn new(
        target: ComputeTarget,
        pipeline_loader: Arc<dyn Loader<dyn SketchPipeline>>,
        detector_loader: Arc<dyn Loader<dyn EdgeDetector>>,
    ) -> Self {
        Self {
            target,
            pipeline: ModelSlot::new("pipeline", pipeline_loader),
            detector: ModelSlot::new("edge detector", detector_loader),
        }
    }

    /// Cache backed by the ControlNet pipeline and HED detector from the hub.
    pub fn from_hub(target: ComputeTarget, api: Api, repos: ModelRepos) -> Self {
        Self::new(
            target,
            Arc::new(ControlNetLoader::new(api.clone(), repos.clone())),
            Arc::new(HedLoader::new(api, repos)),
        )
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<dyn SketchPipeline>, SketchError> {
        self.pipeline.ensure_loaded(&self.target).await
    }

    pub async fn ensure_detector(&self) -> Result<Arc<dyn EdgeDetector>, SketchError> {
        self.detector.ensure_loaded(&self.target).await
    }

    /// Whether the pipeline is ready; never triggers a load.
    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_loaded()
    }

    pub fn pipeline(&self) -> &ModelSlot<dyn SketchPipeline> {
        &self.pipeline
    }

    pub fn detector(&self) -> &ModelSlot<dyn EdgeDetector> {
        &self.detector
    }
}
