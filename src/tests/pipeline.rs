use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::app::CaptureRequest;
use crate::items::{BackendCsv, ItemCreate, ItemStore};
use crate::tests::{
    build_app, test_config, wait_until, DisabledSemantics, PanickingAnalyzer, RecordingSemantics,
    ScriptedAnalyzer,
};

fn queued_capture(url: &str, content: &str) -> CaptureRequest {
    CaptureRequest {
        url: Some(url.to_string()),
        content: Some(content.to_string()),
        allow_server_extract: false,
        ..Default::default()
    }
}

#[test]
pub fn test_queue_enriches_in_background() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let analyzer = Arc::new(ScriptedAnalyzer::new(Duration::from_millis(50)));
    let semantic = Arc::new(RecordingSemantics::new());
    let mut app = build_app(&tmp, config, analyzer.clone(), semantic.clone());
    app.run_queue();

    let outcome = app
        .capture(queued_capture("https://example.com/bg", "background text"))
        .unwrap();
    assert!(outcome.queued);
    assert!(!outcome.item.processed, "enrichment has not landed yet");

    assert!(
        wait_until(
            || app.get_item(outcome.item.id).map(|i| i.processed).unwrap_or(false),
            Duration::from_secs(5),
        ),
        "queued item was never enriched"
    );

    let enriched = app.get_item(outcome.item.id).unwrap();
    assert_eq!(enriched.summary, "analyzed: background text");
    assert_eq!(enriched.keywords, vec!["scripted".to_string()]);

    app.shutdown();
    // enriched keywords were pushed into the tag index and it was flushed
    assert_eq!(*semantic.ensured.lock().unwrap(), vec!["scripted".to_string()]);
    assert!(semantic.saves.load(Ordering::SeqCst) >= 1);
}

#[test]
pub fn test_recapture_while_queued_is_enriched_once() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    config.write().unwrap().worker_threads = 1;
    let analyzer = Arc::new(ScriptedAnalyzer::new(Duration::from_millis(500)));
    let mut app = build_app(&tmp, config, analyzer.clone(), Arc::new(DisabledSemantics));
    app.run_queue();

    // the first job holds the single worker for 500ms
    let first = app
        .capture(queued_capture("https://example.com/one", "first page text"))
        .unwrap();
    assert!(first.queued);

    // the second job sits queued behind it
    let second = app
        .capture(queued_capture("https://example.com/two", "second draft"))
        .unwrap();
    assert!(second.queued);

    // re-capturing the queued item must not add a second job; the
    // pending job picks up the newest content when it runs
    let recapture = app
        .capture(queued_capture("https://example.com/two", "final text"))
        .unwrap();
    assert!(recapture.queued);
    assert_eq!(recapture.item.id, second.item.id);

    app.shutdown();

    let calls = analyzer.calls.lock().unwrap();
    assert_eq!(calls.len(), 2, "re-captured item was enriched more than once");
    assert!(calls.contains(&"final text".to_string()));

    let enriched = app.get_item(second.item.id).unwrap();
    assert!(enriched.processed);
    assert_eq!(enriched.summary, "analyzed: final text");
}

#[test]
pub fn test_startup_requeues_unprocessed_items() {
    let tmp = tempfile::tempdir().unwrap();

    // a previous run captured something and died before enriching it
    {
        let seed = BackendCsv::load(&tmp.path().join("items.csv")).unwrap();
        seed.create(ItemCreate {
            owner: "local".to_string(),
            url: "https://example.com/leftover".to_string(),
            title: "Leftover".to_string(),
            source: "example.com".to_string(),
            content_type: "web".to_string(),
            content: "text that never got processed".to_string(),
            ..Default::default()
        })
        .unwrap();
    }

    let config = test_config(&tmp);
    let analyzer = Arc::new(ScriptedAnalyzer::new(Duration::ZERO));
    let mut app = build_app(&tmp, config, analyzer.clone(), Arc::new(DisabledSemantics));
    app.run_queue();

    assert!(
        wait_until(
            || app.get_item(1).map(|i| i.processed).unwrap_or(false),
            Duration::from_secs(5),
        ),
        "leftover item was never requeued"
    );
    app.shutdown();
    assert_eq!(analyzer.calls.lock().unwrap().len(), 1);
}

#[test]
pub fn test_shutdown_drains_queued_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let analyzer = Arc::new(ScriptedAnalyzer::new(Duration::from_millis(200)));
    let semantic = Arc::new(RecordingSemantics::new());
    let mut app = build_app(&tmp, config, analyzer, semantic.clone());
    app.run_queue();

    for n in 0..3 {
        let outcome = app
            .capture(queued_capture(
                &format!("https://example.com/{n}"),
                &format!("page {n}"),
            ))
            .unwrap();
        assert!(outcome.queued);
    }

    // drains everything queued ahead of the sentinel before returning
    app.shutdown();

    for id in 1..=3 {
        assert!(app.get_item(id).unwrap().processed, "item {id} was dropped");
    }
    assert!(semantic.saves.load(Ordering::SeqCst) >= 1);
}

#[test]
pub fn test_worker_panic_leaves_item_unprocessed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let mut app = build_app(
        &tmp,
        config,
        Arc::new(PanickingAnalyzer),
        Arc::new(DisabledSemantics),
    );
    app.run_queue();

    let outcome = app
        .capture(queued_capture("https://example.com/poison", "bad text"))
        .unwrap();
    assert!(outcome.queued);

    // shutdown still drains: the watcher cleans up after the panic,
    // otherwise this would hang forever
    app.shutdown();

    let item = app.get_item(outcome.item.id).unwrap();
    assert!(!item.processed, "a failed job must not mark the item done");

    let status = app.status().unwrap();
    assert!(status.processing);
    assert_eq!(status.count, 1);
}
