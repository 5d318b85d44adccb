//! Presentation adapter for logo images
//!
//! A [`LogoView`] binds a source to a rendered image. It shows the original
//! immediately, swaps to the processed result when the controller resolves,
//! and marks the image with a reduced-opacity class while processing. A
//! fallback is silent: the original simply stays on screen.

use crate::pipeline::{Pipeline, PipelineController};
use crate::source::{DisplayReference, SourceReference};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// CSS class applied while processing
pub const PROCESSING_CLASS: &str = "opacity-75";

/// Snapshot of what the view renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub src: String,
    pub alt: String,
    pub class_name: String,
}

impl RenderedImage {
    /// Render as an HTML `img` element
    #[must_use]
    pub fn to_html(&self) -> String {
        let mut html = format!(
            "<img src=\"{}\" alt=\"{}\"",
            escape_attribute(&self.src),
            escape_attribute(&self.alt)
        );
        if !self.class_name.is_empty() {
            html.push_str(&format!(" class=\"{}\"", escape_attribute(&self.class_name)));
        }
        html.push('>');
        html
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

struct Binding {
    source: Option<SourceReference>,
    token: CancellationToken,
    torn_down: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Display component bound to one logo source at a time
pub struct LogoView {
    controller: Arc<PipelineController>,
    alt: String,
    class_name: String,
    displayed: Arc<watch::Sender<Option<DisplayReference>>>,
    binding: Mutex<Binding>,
}

impl std::fmt::Debug for LogoView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogoView")
            .field("alt", &self.alt)
            .field("displayed", &*self.displayed.borrow())
            .finish_non_exhaustive()
    }
}

impl LogoView {
    /// Create a view driven by `controller`
    #[must_use]
    pub fn new<S: Into<String>>(controller: Arc<PipelineController>, alt: S) -> Self {
        let (displayed, _) = watch::channel(None);
        Self {
            controller,
            alt: alt.into(),
            class_name: String::new(),
            displayed: Arc::new(displayed),
            binding: Mutex::new(Binding {
                source: None,
                token: CancellationToken::new(),
                torn_down: false,
                tasks: Vec::new(),
            }),
        }
    }

    /// Create a view with its own controller on a shared pipeline
    #[must_use]
    pub fn with_pipeline<S: Into<String>>(pipeline: Pipeline, alt: S) -> Self {
        Self::new(Arc::new(PipelineController::new(pipeline)), alt)
    }

    /// Base CSS classes of the rendered image
    #[must_use]
    pub fn with_class_name<S: Into<String>>(mut self, class_name: S) -> Self {
        self.class_name = class_name.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    /// Bind `source`, starting processing if it differs from the bound one
    ///
    /// Switching sources releases the result held for the previous one.
    /// Returns whether an invocation was started. Must be called within a
    /// Tokio runtime; without one the original stays displayed.
    pub fn bind(&self, source: SourceReference) -> bool {
        let mut binding = self.lock();
        if binding.torn_down {
            log::warn!("Ignoring bind of {} on a torn down view", source);
            return false;
        }
        if binding.source.as_ref() == Some(&source) {
            return false;
        }

        binding.token.cancel();
        // The previous result is no longer displayed once the original shows
        if let Some(reference) = self.controller.release() {
            log::debug!("Released {} on rebind", reference);
        }
        let token = CancellationToken::new();
        binding.token = token.clone();
        binding.source = Some(source.clone());
        binding.tasks.retain(|task| !task.is_finished());
        self.displayed
            .send_replace(Some(DisplayReference::Original(source.clone())));

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("No async runtime to process {}: {}", source, e);
                return false;
            },
        };

        let controller = Arc::clone(&self.controller);
        let displayed = Arc::clone(&self.displayed);
        let task = runtime.spawn(async move {
            let outcome = controller.process_detailed(&source, &token).await;
            // Checked under the channel lock, so a rebind's cancel-then-display
            // can never be overwritten by this stale result
            displayed.send_if_modified(|current| {
                if token.is_cancelled() {
                    return false;
                }
                let next = outcome.display_reference();
                if current.as_ref() == Some(&next) {
                    return false;
                }
                *current = Some(next);
                true
            });
        });
        binding.tasks.push(task);
        true
    }

    /// Currently bound source
    #[must_use]
    pub fn source(&self) -> Option<SourceReference> {
        self.lock().source.clone()
    }

    /// Reference currently displayed
    #[must_use]
    pub fn displayed(&self) -> Option<DisplayReference> {
        self.displayed.borrow().clone()
    }

    /// Receive every displayed-reference change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<DisplayReference>> {
        self.displayed.subscribe()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.controller.is_processing()
    }

    /// Render the current state
    #[must_use]
    pub fn render(&self) -> RenderedImage {
        let src = self
            .displayed()
            .map(|reference| reference.as_str().to_string())
            .unwrap_or_default();
        let class_name = if self.is_processing() {
            if self.class_name.is_empty() {
                PROCESSING_CLASS.to_string()
            } else {
                format!("{} {}", self.class_name, PROCESSING_CLASS)
            }
        } else {
            self.class_name.clone()
        };
        RenderedImage {
            src,
            alt: self.alt.clone(),
            class_name,
        }
    }

    /// Number of invocations still running
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Wait for every invocation this view started to finish
    pub async fn settled(&self) {
        let tasks = std::mem::take(&mut self.lock().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Logo processing task failed: {}", e);
            }
        }
    }

    /// Stop displaying and release everything this view holds
    ///
    /// Pending invocations are cancelled; a result that still gets published
    /// is released when its invocation returns.
    pub fn teardown(&self) {
        let mut binding = self.lock();
        if binding.torn_down {
            return;
        }
        binding.torn_down = true;
        binding.token.cancel();
        drop(binding);

        if let Some(reference) = self.controller.release() {
            log::debug!("Released {} on teardown", reference);
        }
        self.displayed.send_replace(None);
    }
}

impl Drop for LogoView {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::test_utils::{MockEngine, MockFetcher};

    const LOGO: &str = "https://cdn.example/logo.png";

    fn view(engine: &MockEngine, fetcher: &MockFetcher) -> LogoView {
        let pipeline = Pipeline::builder(Arc::new(engine.clone()))
            .config(PipelineConfig::builder().deduplicate(false).build().unwrap())
            .fetcher(Arc::new(fetcher.clone()))
            .build()
            .unwrap();
        LogoView::with_pipeline(pipeline, "Acme Pizza").with_class_name("logo")
    }

    #[test]
    fn test_html_escaping() {
        let rendered = RenderedImage {
            src: "https://cdn.example/a.png?x=1&y=\"2\"".to_string(),
            alt: "Tom's <Diner>".to_string(),
            class_name: "logo opacity-75".to_string(),
        };
        assert_eq!(
            rendered.to_html(),
            "<img src=\"https://cdn.example/a.png?x=1&amp;y=&quot;2&quot;\" \
             alt=\"Tom&#39;s &lt;Diner&gt;\" class=\"logo opacity-75\">"
        );
    }

    #[tokio::test]
    async fn test_original_shown_then_swapped() {
        let engine = MockEngine::new_gated();
        let fetcher = MockFetcher::new().with_png(LOGO, 8, 8);
        let view = view(&engine, &fetcher);
        let source = SourceReference::new(LOGO);

        assert!(view.bind(source.clone()));
        assert_eq!(view.render().src, LOGO);

        engine.wait_for_calls(1).await;
        assert_eq!(view.render().class_name, "logo opacity-75");

        engine.open_gate(1);
        view.settled().await;

        let rendered = view.render();
        assert!(rendered.src.starts_with("blob://"));
        assert_eq!(rendered.class_name, "logo");
        assert_eq!(rendered.alt, "Acme Pizza");
    }

    #[tokio::test]
    async fn test_same_source_binds_once() {
        let engine = MockEngine::new();
        let fetcher = MockFetcher::new().with_png(LOGO, 8, 8);
        let view = view(&engine, &fetcher);

        assert!(view.bind(SourceReference::new(LOGO)));
        assert!(!view.bind(SourceReference::new(LOGO)));
        view.settled().await;
        assert!(!view.bind(SourceReference::new(LOGO)));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_keeps_original_without_error_class() {
        let engine = MockEngine::new_failing();
        let fetcher = MockFetcher::new().with_png(LOGO, 8, 8);
        let view = view(&engine, &fetcher);

        view.bind(SourceReference::new(LOGO));
        view.settled().await;
        let rendered = view.render();
        assert_eq!(rendered.src, LOGO);
        assert_eq!(rendered.class_name, "logo");
    }

    #[tokio::test]
    async fn test_teardown_while_pending_leaves_nothing_live() {
        let engine = MockEngine::new_gated();
        let fetcher = MockFetcher::new().with_png(LOGO, 8, 8);
        let view = view(&engine, &fetcher);
        let table = view.controller().pipeline().table().clone();

        view.bind(SourceReference::new(LOGO));
        engine.wait_for_calls(1).await;
        view.teardown();
        engine.open_gate(1);
        view.settled().await;

        assert_eq!(table.live_count(), 0);
        assert_eq!(view.displayed(), None);
        assert!(!view.bind(SourceReference::new(LOGO)));
    }

    #[tokio::test]
    async fn test_rebind_releases_previous_result_immediately() {
        let engine = MockEngine::new_gated();
        let fetcher = MockFetcher::new()
            .with_png(LOGO, 8, 8)
            .with_png("https://cdn.example/logo-v2.png", 8, 8);
        let view = view(&engine, &fetcher);
        let table = view.controller().pipeline().table().clone();

        view.bind(SourceReference::new(LOGO));
        engine.open_gate(1);
        view.settled().await;
        let first = view.displayed().unwrap();
        assert!(table.is_live(first.published().unwrap()));

        view.bind(SourceReference::new("https://cdn.example/logo-v2.png"));
        assert!(!table.is_live(first.published().unwrap()));
        assert_eq!(table.live_count(), 0);
        assert_eq!(view.controller().current(), None);

        engine.open_gate(1);
        view.settled().await;
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_bind_without_runtime_keeps_original() {
        let engine = MockEngine::new();
        let fetcher = MockFetcher::new();
        let pipeline = Pipeline::builder(Arc::new(engine))
            .fetcher(Arc::new(fetcher))
            .build()
            .unwrap();
        let view = LogoView::with_pipeline(pipeline, "logo");

        assert!(!view.bind(SourceReference::new(LOGO)));
        assert_eq!(
            view.displayed(),
            Some(DisplayReference::Original(SourceReference::new(LOGO)))
        );
    }
}
