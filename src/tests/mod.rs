//! Whole-app tests wiring the real store and extractor to stub
//! analyzers and tag services.

mod pipeline;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::app::capture::DedupCache;
use crate::app::App;
use crate::config::Config;
use crate::enrich::{self, Analyzer, Enrichment};
use crate::extract::Extractor;
use crate::items::{BackendCsv, Emotion, ItemStore};
use crate::semantic::{SemanticSearchError, TagMatch, TagSemantics};

pub fn test_config(tmp: &tempfile::TempDir) -> Arc<RwLock<Config>> {
    Arc::new(RwLock::new(Config::load_with(tmp.path())))
}

/// Builds an App over `tmp`. Each test gets its own directory so
/// parallel tests never collide, and no real data is touched.
pub fn build_app(
    tmp: &tempfile::TempDir,
    config: Arc<RwLock<Config>>,
    analyzer: Arc<dyn Analyzer>,
    semantic: Arc<dyn TagSemantics>,
) -> App {
    let (fetch, dedup_ttl) = {
        let config = config.read().unwrap();
        (
            config.fetch.clone(),
            Duration::from_secs(config.dedup_ttl_secs),
        )
    };
    let store: Arc<dyn ItemStore> = Arc::new(
        BackendCsv::load(&tmp.path().join("items.csv")).expect("failed to create item csv"),
    );
    App::with_parts(
        store,
        Arc::new(Extractor::new(fetch)),
        analyzer,
        semantic,
        DedupCache::new(dedup_ttl),
        config,
    )
}

/// App with the heuristic analyzer and semantic search off, the default
/// standalone shape.
pub fn create_app() -> (App, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let config = test_config(&tmp);
    let analyzer = {
        let config = config.read().unwrap();
        enrich::from_config(&config.analyzer)
    };
    let app = build_app(&tmp, config, analyzer, Arc::new(DisabledSemantics));
    (app, tmp)
}

pub fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

pub struct DisabledSemantics;

impl TagSemantics for DisabledSemantics {
    fn enabled(&self) -> bool {
        false
    }
    fn ensure_tags(&self, _tags: &[String]) -> Result<usize, SemanticSearchError> {
        Err(SemanticSearchError::Disabled)
    }
    fn similar_tags(
        &self,
        _query: &str,
        _threshold: Option<f32>,
        _limit: usize,
    ) -> Result<Vec<TagMatch>, SemanticSearchError> {
        Err(SemanticSearchError::Disabled)
    }
    fn save_index(&self) -> Result<(), SemanticSearchError> {
        Err(SemanticSearchError::Disabled)
    }
}

/// Records every ensured tag and index save, matches nothing.
pub struct RecordingSemantics {
    pub ensured: Mutex<Vec<String>>,
    pub saves: AtomicUsize,
}

impl RecordingSemantics {
    pub fn new() -> RecordingSemantics {
        RecordingSemantics {
            ensured: Mutex::new(Vec::new()),
            saves: AtomicUsize::new(0),
        }
    }
}

impl TagSemantics for RecordingSemantics {
    fn enabled(&self) -> bool {
        true
    }
    fn ensure_tags(&self, tags: &[String]) -> Result<usize, SemanticSearchError> {
        self.ensured.lock().unwrap().extend(tags.iter().cloned());
        Ok(tags.len())
    }
    fn similar_tags(
        &self,
        _query: &str,
        _threshold: Option<f32>,
        _limit: usize,
    ) -> Result<Vec<TagMatch>, SemanticSearchError> {
        Ok(Vec::new())
    }
    fn save_index(&self) -> Result<(), SemanticSearchError> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Analyzer that records what it was fed and can be slowed down to
/// keep a worker busy.
pub struct ScriptedAnalyzer {
    pub delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedAnalyzer {
    pub fn new(delay: Duration) -> ScriptedAnalyzer {
        ScriptedAnalyzer {
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Analyzer for ScriptedAnalyzer {
    fn analyze(&self, text: &str) -> Enrichment {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.calls.lock().unwrap().push(text.to_string());
        Enrichment {
            summary: format!("analyzed: {}", text.chars().take(40).collect::<String>()),
            keywords: vec!["scripted".to_string()],
            emotion: Emotion::Neutral,
            sentiment_score: 0.0,
        }
    }
}

pub struct PanickingAnalyzer;

impl Analyzer for PanickingAnalyzer {
    fn analyze(&self, _text: &str) -> Enrichment {
        panic!("analyzer blew up");
    }
}
