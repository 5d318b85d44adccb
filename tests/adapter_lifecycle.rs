//! Presentation adapter lifecycle tests
//!
//! Binding, swapping, rebinding and teardown of `LogoView`, with a gated
//! engine holding invocations in flight where timing matters.

use std::sync::Arc;
use storefront_bgremove::{
    test_utils::{MockEngine, MockFetcher},
    DisplayReference, LogoView, Pipeline, PipelineConfig, PipelineController, SourceReference,
    PROCESSING_CLASS,
};

const LOGO: &str = "https://cdn.example/logo.png";
const NEW_LOGO: &str = "https://cdn.example/logo-2024.png";

fn build_pipeline(engine: &MockEngine, fetcher: &MockFetcher, deduplicate: bool) -> Pipeline {
    Pipeline::builder(Arc::new(engine.clone()))
        .config(
            PipelineConfig::builder()
                .deduplicate(deduplicate)
                .build()
                .unwrap(),
        )
        .fetcher(Arc::new(fetcher.clone()))
        .build()
        .unwrap()
}

fn fetcher() -> MockFetcher {
    MockFetcher::new()
        .with_png(LOGO, 12, 12)
        .with_png(NEW_LOGO, 20, 10)
}

#[tokio::test]
async fn teardown_while_pending_releases_eventual_result() {
    let engine = MockEngine::new_gated();
    let pipeline = build_pipeline(&engine, &fetcher(), false);
    let table = pipeline.table().clone();
    let view = LogoView::with_pipeline(pipeline, "Acme");

    view.bind(SourceReference::new(LOGO));
    engine.wait_for_calls(1).await;
    view.teardown();

    engine.open_gate(1);
    view.settled().await;

    let stats = table.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.created, stats.released);
    assert_eq!(stats.invalid_releases, 0);
    assert_eq!(view.displayed(), None);
}

#[tokio::test]
async fn teardown_leaves_shared_execution_to_remaining_consumer() {
    let engine = MockEngine::new_gated();
    let pipeline = build_pipeline(&engine, &fetcher(), true);
    let table = pipeline.table().clone();
    let view = LogoView::with_pipeline(pipeline.clone(), "Acme");
    let other = PipelineController::new(pipeline);
    let source = SourceReference::new(LOGO);

    view.bind(source.clone());
    engine.wait_for_calls(1).await;
    let (display, ()) = tokio::join!(other.process(&source), async {
        view.teardown();
        engine.open_gate(1);
    });
    view.settled().await;

    // The execution outlived the torn down view and only the other consumer holds it
    let reference = display.published().unwrap();
    assert_eq!(engine.call_count(), 1);
    assert_eq!(table.ref_count(reference), 1);

    other.release();
    assert_eq!(table.live_count(), 0);
    assert_eq!(table.stats().invalid_releases, 0);
}

#[tokio::test]
async fn dropping_view_releases_displayed_result() {
    let engine = MockEngine::new();
    let pipeline = build_pipeline(&engine, &fetcher(), true);
    let table = pipeline.table().clone();

    let view = LogoView::with_pipeline(pipeline, "Acme");
    view.bind(SourceReference::new(LOGO));
    view.settled().await;
    let shown = view.displayed().unwrap();
    assert!(shown.is_published());
    assert!(table.is_live(shown.published().unwrap()));

    drop(view);
    assert!(!table.is_live(shown.published().unwrap()));
    assert_eq!(table.live_count(), 0);
}

#[tokio::test]
async fn controller_invoked_once_per_distinct_source() {
    let engine = MockEngine::new();
    let fetcher = fetcher();
    let view = LogoView::with_pipeline(build_pipeline(&engine, &fetcher, false), "Acme");

    for _ in 0..3 {
        view.bind(SourceReference::new(LOGO));
    }
    view.settled().await;
    assert_eq!(fetcher.get_call_history(), vec![LOGO]);

    view.bind(SourceReference::new(NEW_LOGO));
    view.bind(SourceReference::new(NEW_LOGO));
    view.settled().await;
    assert_eq!(fetcher.get_call_history(), vec![LOGO, NEW_LOGO]);
}

#[tokio::test]
async fn rebinding_releases_previous_before_new_result() {
    let engine = MockEngine::new_gated();
    let pipeline = build_pipeline(&engine, &fetcher(), false);
    let table = pipeline.table().clone();
    let view = LogoView::with_pipeline(pipeline, "Acme");

    // First source completes and is displayed
    view.bind(SourceReference::new(LOGO));
    engine.open_gate(1);
    view.settled().await;
    let first = view.displayed().unwrap();
    assert!(first.is_published());

    // Second source is pending: original shown, first result already released
    view.bind(SourceReference::new(NEW_LOGO));
    assert_eq!(
        view.displayed(),
        Some(DisplayReference::Original(SourceReference::new(NEW_LOGO)))
    );
    assert!(!table.is_live(first.published().unwrap()));
    assert_eq!(table.live_count(), 0);
    engine.wait_for_calls(2).await;
    assert!(view.render().class_name.contains(PROCESSING_CLASS));

    engine.open_gate(1);
    view.settled().await;
    let second = view.displayed().unwrap();
    assert!(second.is_published());
    assert_ne!(first, second);
    assert!(!table.is_live(first.published().unwrap()));
    assert_eq!(table.live_count(), 1);
}

#[tokio::test]
async fn rebinding_before_completion_never_shows_stale_result() {
    let engine = MockEngine::new_gated();
    let pipeline = build_pipeline(&engine, &fetcher(), false);
    let table = pipeline.table().clone();
    let view = LogoView::with_pipeline(pipeline, "Acme");

    view.bind(SourceReference::new(LOGO));
    engine.wait_for_calls(1).await;
    view.bind(SourceReference::new(NEW_LOGO));
    engine.wait_for_calls(2).await;
    engine.open_gate(2);
    view.settled().await;

    let shown = view.displayed().unwrap();
    let resource = table.resolve(shown.as_str()).unwrap();
    assert_eq!((resource.width, resource.height), (20, 10));
    assert_eq!(table.live_count(), 1);
}

#[tokio::test]
async fn fallback_shows_original_without_error_treatment() {
    let engine = MockEngine::new_failing();
    let view = LogoView::with_pipeline(build_pipeline(&engine, &fetcher(), true), "Acme")
        .with_class_name("h-12 w-12");

    view.bind(SourceReference::new(LOGO));
    view.settled().await;

    let rendered = view.render();
    assert_eq!(rendered.src, LOGO);
    assert_eq!(rendered.class_name, "h-12 w-12");
    assert_eq!(
        rendered.to_html(),
        format!("<img src=\"{}\" alt=\"Acme\" class=\"h-12 w-12\">", LOGO)
    );
}

#[tokio::test]
async fn subscribers_observe_original_then_published() {
    let engine = MockEngine::new_gated();
    let view = LogoView::with_pipeline(build_pipeline(&engine, &fetcher(), true), "Acme");
    let mut displayed = view.subscribe();

    view.bind(SourceReference::new(LOGO));
    displayed.changed().await.unwrap();
    assert_eq!(
        *displayed.borrow_and_update(),
        Some(DisplayReference::Original(SourceReference::new(LOGO)))
    );

    engine.open_gate(1);
    displayed.changed().await.unwrap();
    assert!(displayed
        .borrow_and_update()
        .as_ref()
        .is_some_and(DisplayReference::is_published));
}
