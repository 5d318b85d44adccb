//! Pipeline orchestration
//!
//! [`Pipeline`] sequences fetch, decode, background removal and publishing for
//! one source. [`PipelineController`] is the per-consumer front: it tracks the
//! consumer's [`PipelineState`], owns the consumer's current published result
//! and converts every stage failure into a fallback to the original source.

use crate::config::PipelineConfig;
use crate::decode::{ImageDecoder, RasterDecoder};
use crate::dedupe::InflightRegistry;
use crate::engine::BackgroundRemovalEngine;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::fetch::{HttpFetcher, ResourceFetcher};
use crate::progress::{NoOpProgressReporter, PipelineStage, ProgressReporter};
use crate::publish::{PublishedHandle, PublishedReference, ResourceTable};
use crate::source::{DisplayReference, SourceReference};
use futures::future::FutureExt;
use instant::Instant;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

/// Shared pipeline: stage collaborators plus the resource table
///
/// Cloning is cheap and yields a handle to the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    fetcher: Arc<dyn ResourceFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    engine: Arc<dyn BackgroundRemovalEngine>,
    table: ResourceTable,
    registry: Option<InflightRegistry>,
    reporter: Arc<dyn ProgressReporter>,
    config: PipelineConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("engine", &self.inner.engine.name())
            .field("table", &self.inner.table)
            .field("deduplicate", &self.inner.registry.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Start building a pipeline around `engine`
    #[must_use]
    pub fn builder(engine: Arc<dyn BackgroundRemovalEngine>) -> PipelineBuilder {
        PipelineBuilder::new(engine)
    }

    #[must_use]
    pub fn table(&self) -> &ResourceTable {
        &self.inner.table
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> Option<&InflightRegistry> {
        self.inner.registry.as_ref()
    }

    #[must_use]
    pub fn reporter(&self) -> &Arc<dyn ProgressReporter> {
        &self.inner.reporter
    }

    /// Run all stages for `source`, yielding an owned handle on the result
    ///
    /// With deduplication enabled, identical concurrent sources share one
    /// execution and each caller receives its own handle.
    ///
    /// # Errors
    /// - The first failing stage's error
    /// - `PipelineError::Cancelled` if `token` fires before completion
    pub async fn run(
        &self,
        source: &SourceReference,
        token: &CancellationToken,
    ) -> Result<PublishedHandle> {
        match &self.inner.registry {
            Some(registry) => {
                registry
                    .acquire(source, token, |execution_token| {
                        let pipeline = self.clone();
                        let source = source.clone();
                        async move { pipeline.execute(&source, &execution_token).await }.boxed()
                    })
                    .await
            },
            None => self.execute(source, token).await,
        }
    }

    #[instrument(skip_all, fields(source = %source))]
    async fn execute(
        &self,
        source: &SourceReference,
        token: &CancellationToken,
    ) -> Result<PublishedHandle> {
        let start = Instant::now();
        let reporter = &self.inner.reporter;

        reporter.report_stage(source, PipelineStage::Fetching);
        let raw = stage(
            token,
            source,
            PipelineStage::Fetching,
            self.inner.fetcher.fetch(source),
        )
        .instrument(tracing::debug_span!("fetch"))
        .await?;
        debug!(bytes = raw.len(), "Fetched source");

        reporter.report_stage(source, PipelineStage::Decoding);
        let decoded = stage(
            token,
            source,
            PipelineStage::Decoding,
            self.inner.decoder.decode(raw),
        )
        .instrument(tracing::debug_span!("decode"))
        .await?;
        let (width, height) = decoded.dimensions();
        debug!(width, height, format = ?decoded.format(), "Decoded source");

        reporter.report_stage(source, PipelineStage::Inference);
        let processed = stage(
            token,
            source,
            PipelineStage::Inference,
            self.inner.engine.remove_background(decoded),
        )
        .instrument(tracing::debug_span!("inference", engine = self.inner.engine.name()))
        .await?;

        checkpoint(token, source, PipelineStage::Publishing)?;
        reporter.report_stage(source, PipelineStage::Publishing);
        let handle = self.inner.table.publish(processed)?;

        // Consumer left while publishing; the handle is released on return
        checkpoint(token, source, PipelineStage::Completed)?;

        info!(
            reference = %handle.reference(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Background removed"
        );
        Ok(handle)
    }
}

fn checkpoint(
    token: &CancellationToken,
    source: &SourceReference,
    stage: PipelineStage,
) -> Result<()> {
    if token.is_cancelled() {
        return Err(PipelineError::cancelled(format!(
            "{} cancelled before '{}'",
            source, stage
        )));
    }
    Ok(())
}

/// Await a stage, giving up as soon as the token fires
async fn stage<T, F>(
    token: &CancellationToken,
    source: &SourceReference,
    stage: PipelineStage,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    checkpoint(token, source, stage)?;
    tokio::select! {
        biased;
        () = token.cancelled() => Err(PipelineError::cancelled(format!(
            "{} cancelled during '{}'",
            source, stage
        ))),
        result = work => result,
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    engine: Arc<dyn BackgroundRemovalEngine>,
    config: PipelineConfig,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    table: Option<ResourceTable>,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(engine: Arc<dyn BackgroundRemovalEngine>) -> Self {
        Self {
            engine,
            config: PipelineConfig::default(),
            fetcher: None,
            decoder: None,
            table: None,
            reporter: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`HttpFetcher`]
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the default [`RasterDecoder`]
    #[must_use]
    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Publish into an existing table instead of a fresh one
    #[must_use]
    pub fn table(mut self, table: ResourceTable) -> Self {
        self.table = Some(table);
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the pipeline
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Failed to create the default HTTP fetcher
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::from_config(&self.config)?),
        };
        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(RasterDecoder::from_config(&self.config)));
        let table = self
            .table
            .unwrap_or_else(|| ResourceTable::with_capacity(self.config.max_published_resources));
        let registry = self
            .config
            .deduplicate
            .then(|| InflightRegistry::new(table.clone()));
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(NoOpProgressReporter));

        debug!(
            engine = self.engine.name(),
            deduplicate = self.config.deduplicate,
            "Pipeline built"
        );

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                fetcher,
                decoder,
                engine: self.engine,
                table,
                registry,
                reporter,
                config: self.config,
            }),
        })
    }
}

/// Lifecycle phase of a consumer's pipeline state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelinePhase {
    #[default]
    Idle,
    Processing,
    Succeeded,
    FellBack,
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Background removed and published
    Succeeded(PublishedReference),
    /// A stage failed; the original source should be displayed
    FellBack {
        source: SourceReference,
        kind: ErrorKind,
    },
    /// The consumer lost interest before completion
    Cancelled(SourceReference),
}

impl ProcessOutcome {
    /// Reference the consumer should display for this outcome
    #[must_use]
    pub fn display_reference(&self) -> DisplayReference {
        match self {
            Self::Succeeded(reference) => DisplayReference::Published(reference.clone()),
            Self::FellBack { source, .. } | Self::Cancelled(source) => {
                DisplayReference::Original(source.clone())
            },
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Observable state of one consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    pub is_processing: bool,
    pub result: Option<PublishedReference>,
    pub phase: PipelinePhase,
    pub last_outcome: Option<ProcessOutcome>,
}

impl PipelineState {
    fn processing() -> Self {
        Self {
            is_processing: true,
            phase: PipelinePhase::Processing,
            ..Self::default()
        }
    }
}

struct ControllerSlot {
    generation: u64,
    current: Option<PublishedHandle>,
}

/// Per-consumer controller
///
/// Holds at most one current published result. A newer invocation supersedes
/// older ones: results of superseded or cancelled invocations are released
/// without touching the state.
pub struct PipelineController {
    pipeline: Pipeline,
    state: watch::Sender<PipelineState>,
    slot: Mutex<ControllerSlot>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            pipeline,
            state,
            slot: Mutex::new(ControllerSlot {
                generation: 0,
                current: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process `source`, returning what the consumer should display
    ///
    /// Never fails: any stage failure yields the original source.
    pub async fn process(&self, source: &SourceReference) -> DisplayReference {
        self.process_detailed(source, &CancellationToken::new())
            .await
            .display_reference()
    }

    /// Process `source` and report how the invocation ended
    pub async fn process_detailed(
        &self,
        source: &SourceReference,
        token: &CancellationToken,
    ) -> ProcessOutcome {
        let generation = {
            let mut slot = self.lock();
            slot.generation += 1;
            self.publish_state(PipelineState::processing());
            slot.generation
        };

        let result = self.pipeline.run(source, token).await;

        let mut slot = self.lock();
        if slot.generation != generation {
            drop(slot);
            debug!(source = %source, "Discarding result of superseded invocation");
            return ProcessOutcome::Cancelled(source.clone());
        }
        if token.is_cancelled() {
            debug!(source = %source, "Discarding result of cancelled invocation");
            return self.settle_cancelled(&slot, source);
        }

        match result {
            Ok(handle) => {
                let reference = handle.reference().clone();
                let previous = slot.current.replace(handle);
                let outcome = ProcessOutcome::Succeeded(reference.clone());
                self.publish_state(PipelineState {
                    is_processing: false,
                    result: Some(reference),
                    phase: PipelinePhase::Succeeded,
                    last_outcome: Some(outcome.clone()),
                });
                drop(slot);
                drop(previous);
                self.pipeline
                    .reporter()
                    .report_stage(source, PipelineStage::Completed);
                outcome
            },
            Err(error) if error.is_cancelled() => self.settle_cancelled(&slot, source),
            Err(error) => {
                let kind = error.kind();
                let previous = slot.current.take();
                let outcome = ProcessOutcome::FellBack {
                    source: source.clone(),
                    kind,
                };
                self.publish_state(PipelineState {
                    is_processing: false,
                    result: None,
                    phase: PipelinePhase::FellBack,
                    last_outcome: Some(outcome.clone()),
                });
                drop(slot);
                drop(previous);

                warn!(
                    source = %source,
                    kind = %kind,
                    error = %error,
                    "Processing failed, falling back to original image"
                );
                let reporter = self.pipeline.reporter();
                reporter.report_error(source, PipelineStage::for_error(kind), &error);
                reporter.report_stage(source, PipelineStage::FellBack);
                outcome
            },
        }
    }

    /// End the current invocation without a new result; a held result stays
    fn settle_cancelled(&self, slot: &ControllerSlot, source: &SourceReference) -> ProcessOutcome {
        let outcome = ProcessOutcome::Cancelled(source.clone());
        let result = slot.current.as_ref().map(|h| h.reference().clone());
        let phase = if result.is_some() {
            PipelinePhase::Succeeded
        } else {
            PipelinePhase::Idle
        };
        self.publish_state(PipelineState {
            is_processing: false,
            result,
            phase,
            last_outcome: Some(outcome.clone()),
        });
        outcome
    }

    fn publish_state(&self, state: PipelineState) {
        self.pipeline.reporter().report_state(&state);
        self.state.send_replace(state);
    }

    /// Current state snapshot
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Receive every state replacement
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing
    }

    /// Reference of the result this consumer currently holds
    #[must_use]
    pub fn current(&self) -> Option<PublishedReference> {
        self.lock().current.as_ref().map(|h| h.reference().clone())
    }

    /// Release the held result and return to idle
    ///
    /// Invocations still in flight become stale; their results are released
    /// when they complete. Returns the released reference, if any.
    pub fn release(&self) -> Option<PublishedReference> {
        let mut slot = self.lock();
        slot.generation += 1;
        let previous = slot.current.take();
        self.publish_state(PipelineState::default());
        drop(slot);
        previous.map(|handle| handle.reference().clone())
    }
}
