//! Progress reporting for pipeline invocations
//!
//! Separates stage and state notifications from the pipeline itself, so
//! frontends (CLI progress bars, test probes, metrics) can observe invocations
//! without the pipeline knowing about them.

use crate::error::{ErrorKind, PipelineError};
use crate::pipeline::PipelineState;
use crate::source::SourceReference;

/// Stages an invocation passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Retrieving the source bytes
    Fetching,
    /// Decoding bytes into pixels
    Decoding,
    /// Running the background-removal engine
    Inference,
    /// Publishing the processed bytes as a displayable reference
    Publishing,
    /// Processing completed successfully
    Completed,
    /// A stage failed and the original source is used instead
    FellBack,
}

impl PipelineStage {
    /// Get a human-readable description of the stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            PipelineStage::Fetching => "Fetching source image",
            PipelineStage::Decoding => "Decoding image",
            PipelineStage::Inference => "Removing background",
            PipelineStage::Publishing => "Publishing processed image",
            PipelineStage::Completed => "Processing completed",
            PipelineStage::FellBack => "Falling back to original image",
        }
    }

    /// Get the typical progress percentage for this stage
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            PipelineStage::Fetching => 10,
            PipelineStage::Decoding => 25,
            PipelineStage::Inference => 80,
            PipelineStage::Publishing => 95,
            PipelineStage::Completed | PipelineStage::FellBack => 100,
        }
    }

    /// Stage that raises errors of the given kind
    #[must_use]
    pub fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Fetch => PipelineStage::Fetching,
            ErrorKind::Decode => PipelineStage::Decoding,
            ErrorKind::Inference => PipelineStage::Inference,
            ErrorKind::Publish => PipelineStage::Publishing,
            _ => PipelineStage::FellBack,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Trait for observing pipeline invocations
pub trait ProgressReporter: Send + Sync {
    /// Report that an invocation entered a stage
    fn report_stage(&self, source: &SourceReference, stage: PipelineStage);

    /// Report a new controller state snapshot
    fn report_state(&self, _state: &PipelineState) {}

    /// Report a recoverable stage failure
    fn report_error(&self, source: &SourceReference, stage: PipelineStage, error: &PipelineError);
}

/// No-op progress reporter that discards all notifications
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_stage(&self, _source: &SourceReference, _stage: PipelineStage) {}

    fn report_error(&self, _source: &SourceReference, _stage: PipelineStage, _error: &PipelineError) {}
}

/// Progress reporter that forwards notifications to the `log` facade
pub struct LogProgressReporter {
    verbose: bool,
}

impl LogProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for LogProgressReporter {
    fn report_stage(&self, source: &SourceReference, stage: PipelineStage) {
        if self.verbose {
            log::info!("[{:>3}%] {} ({})", stage.progress_percentage(), stage, source);
        } else {
            log::debug!("{} ({})", stage, source);
        }
    }

    fn report_state(&self, state: &PipelineState) {
        log::trace!(
            "state: processing={} result={:?}",
            state.is_processing,
            state.result.as_ref().map(ToString::to_string)
        );
    }

    fn report_error(&self, source: &SourceReference, stage: PipelineStage, error: &PipelineError) {
        log::warn!("{} during '{}' for {}: {}", error.kind(), stage, source, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_percentages_increase() {
        let stages = [
            PipelineStage::Fetching,
            PipelineStage::Decoding,
            PipelineStage::Inference,
            PipelineStage::Publishing,
            PipelineStage::Completed,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].progress_percentage() < pair[1].progress_percentage());
        }
        assert_eq!(PipelineStage::FellBack.progress_percentage(), 100);
    }

    #[test]
    fn test_stage_for_error() {
        assert_eq!(PipelineStage::for_error(ErrorKind::Fetch), PipelineStage::Fetching);
        assert_eq!(PipelineStage::for_error(ErrorKind::Inference), PipelineStage::Inference);
        assert_eq!(PipelineStage::for_error(ErrorKind::Io), PipelineStage::FellBack);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(PipelineStage::Fetching.to_string(), "Fetching source image");
        assert_eq!(PipelineStage::Inference.to_string(), "Removing background");
    }

    #[test]
    fn test_reporters_do_not_panic() {
        let source = SourceReference::new("https://cdn.example/logo.png");
        let error = PipelineError::fetch("boom");
        for reporter in [
            Box::new(NoOpProgressReporter) as Box<dyn ProgressReporter>,
            Box::new(LogProgressReporter::new(true)),
            Box::new(LogProgressReporter::new(false)),
        ] {
            reporter.report_stage(&source, PipelineStage::Fetching);
            reporter.report_state(&PipelineState::default());
            reporter.report_error(&source, PipelineStage::Fetching, &error);
        }
    }
}
