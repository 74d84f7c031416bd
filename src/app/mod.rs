pub mod capture;
pub mod errors;
pub mod worker;

pub use capture::{CaptureOutcome, CaptureRequest};
pub use errors::AppError;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::enrich::{self, Analyzer};
use crate::extract::Extractor;
use crate::items::{BackendCsv, Item, ItemQuery, ItemStore, DEFAULT_OWNER};
use crate::search::{SearchEngine, SearchRequest, SearchResponse};
use crate::semantic::{SemanticSearchError, SemanticTagService, TagSemantics};
use capture::DedupCache;
use worker::{Job, PendingJobs};

const TIMELINE_LIMIT: usize = 20;
const TOP_TAGS_LIMIT: usize = 10;

/// The capture service. Owns the store, the extractor, the analyzer,
/// the tag semantics and the worker pool, and is shared behind an Arc
/// by the http handlers and the cli.
pub struct App {
    store: Arc<dyn ItemStore>,
    extractor: Arc<Extractor>,
    analyzer: Arc<dyn Analyzer>,
    semantic: Arc<dyn TagSemantics>,
    search_engine: SearchEngine,
    dedup: DedupCache,
    pending: PendingJobs,
    job_tx: Option<Arc<mpsc::Sender<Job>>>,
    pool_handle: Mutex<Option<JoinHandle<()>>>,
    config: Arc<RwLock<Config>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub total_items: usize,
    pub by_content_type: BTreeMap<String, usize>,
    pub by_emotion: BTreeMap<String, usize>,
    pub top_tags: Vec<TagCount>,
}

#[derive(Debug, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

/// Derived from the store, not from the pool: `count` is the number of
/// items with `processed = false`, which deliberately includes items
/// whose enrichment failed for good.
#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub processing: bool,
    pub count: usize,
}

impl App {
    pub fn new(config: Arc<RwLock<Config>>, base_path: &Path) -> anyhow::Result<App> {
        let (fetch, analyzer_cfg, semantic_cfg, dedup_ttl) = {
            let config = config.read().unwrap();
            (
                config.fetch.clone(),
                config.analyzer.clone(),
                config.semantic_search.clone(),
                config.dedup_ttl_secs,
            )
        };

        let store: Arc<dyn ItemStore> = Arc::new(BackendCsv::load(&base_path.join("items.csv"))?);
        let extractor = Arc::new(Extractor::new(fetch));
        let analyzer = enrich::from_config(&analyzer_cfg);
        let semantic: Arc<dyn TagSemantics> =
            Arc::new(SemanticTagService::new(semantic_cfg, base_path.to_path_buf()));
        let search_engine = SearchEngine::new(store.clone(), semantic.clone());

        Ok(App {
            store,
            extractor,
            analyzer,
            semantic,
            search_engine,
            dedup: DedupCache::new(Duration::from_secs(dedup_ttl)),
            pending: Arc::new(Mutex::new(HashSet::new())),
            job_tx: None,
            pool_handle: Mutex::new(None),
            config,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        store: Arc<dyn ItemStore>,
        extractor: Arc<Extractor>,
        analyzer: Arc<dyn Analyzer>,
        semantic: Arc<dyn TagSemantics>,
        dedup: DedupCache,
        config: Arc<RwLock<Config>>,
    ) -> App {
        let search_engine = SearchEngine::new(store.clone(), semantic.clone());
        App {
            store,
            extractor,
            analyzer,
            semantic,
            search_engine,
            dedup,
            pending: Arc::new(Mutex::new(HashSet::new())),
            job_tx: None,
            pool_handle: Mutex::new(None),
            config,
        }
    }

    /// Start the worker pool and requeue whatever a previous run left
    /// unprocessed.
    pub fn run_queue(&mut self) {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        self.job_tx = Some(Arc::new(job_tx));

        let store = self.store.clone();
        let analyzer = self.analyzer.clone();
        let semantic = self.semantic.clone();
        let pending = self.pending.clone();
        let config = self.config.clone();
        let handle = std::thread::spawn(move || {
            worker::start_pool(job_rx, store, analyzer, semantic, pending, config);
        });
        *self.pool_handle.lock().unwrap() = Some(handle);

        match self.store.query(ItemQuery {
            processed: Some(false),
            ..Default::default()
        }) {
            Ok(items) => {
                if !items.is_empty() {
                    log::info!("requeueing {} unprocessed items", items.len());
                }
                for item in items {
                    self.enqueue_enrichment(item.id);
                }
            }
            Err(err) => log::error!("scanning for unprocessed items failed: {err}"),
        }
    }

    /// True when the item is now queued (or already was). One item never
    /// has two jobs in flight; the queued job picks up current content.
    pub(crate) fn enqueue_enrichment(&self, item_id: u64) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains(&item_id) {
            return true;
        }
        let Some(job_tx) = &self.job_tx else {
            return false;
        };
        match job_tx.send(Job::Enrich { item_id }) {
            Ok(()) => {
                pending.insert(item_id);
                true
            }
            Err(err) => {
                log::error!("failed to enqueue enrichment for item {item_id}: {err}");
                false
            }
        }
    }

    pub(crate) fn queue_running(&self) -> bool {
        self.job_tx.is_some()
    }

    /// Drain the pool, then flush the tag index. Also safe to call when
    /// the queue never ran.
    pub fn shutdown(&self) {
        if let Some(job_tx) = &self.job_tx {
            if job_tx.send(Job::Shutdown).is_err() {
                log::error!("enrichment pool is not listening for shutdown");
            }
            let handle = self.pool_handle.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("enrichment pool dispatcher panicked");
                }
            }
        }

        match self.semantic.save_index() {
            Ok(()) | Err(SemanticSearchError::Disabled) => {}
            Err(err) => log::warn!("tag vector index save failed: {err}"),
        }
    }

    pub fn search(&self, mut request: SearchRequest) -> Result<SearchResponse, AppError> {
        request.owner = Some(resolve_owner(request.owner.take()));
        if request.limit.is_none() {
            request.limit = Some(self.config.read().unwrap().search_limit);
        }
        Ok(self.search_engine.search(request)?)
    }

    pub fn get_item(&self, id: u64) -> Result<Item, AppError> {
        self.store.get(id)?.ok_or(AppError::NotFound)
    }

    pub fn delete_item(&self, id: u64) -> Result<(), AppError> {
        if self.store.delete(id)? {
            Ok(())
        } else {
            Err(AppError::NotFound)
        }
    }

    pub fn timeline(
        &self,
        owner: Option<String>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, AppError> {
        Ok(self.store.query(ItemQuery {
            owner: Some(resolve_owner(owner)),
            limit: Some(limit.unwrap_or(TIMELINE_LIMIT)),
            ..Default::default()
        })?)
    }

    pub fn insights(&self, owner: Option<String>) -> Result<Insights, AppError> {
        let items = self.store.query(ItemQuery {
            owner: Some(resolve_owner(owner)),
            ..Default::default()
        })?;

        let mut by_content_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_emotion: BTreeMap<String, usize> = BTreeMap::new();
        let mut tag_counts: HashMap<String, usize> = HashMap::new();
        for item in &items {
            *by_content_type.entry(item.content_type.clone()).or_insert(0) += 1;
            if let Some(emotion) = item.emotion {
                *by_emotion.entry(emotion.as_str().to_string()).or_insert(0) += 1;
            }
            for keyword in &item.keywords {
                *tag_counts.entry(keyword.clone()).or_insert(0) += 1;
            }
        }

        let mut top_tags: Vec<TagCount> = tag_counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect();
        top_tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        top_tags.truncate(TOP_TAGS_LIMIT);

        Ok(Insights {
            total_items: items.len(),
            by_content_type,
            by_emotion,
            top_tags,
        })
    }

    pub fn status(&self) -> Result<PipelineStatus, AppError> {
        let count = self.store.unprocessed_count()?;
        Ok(PipelineStatus {
            processing: count > 0,
            count,
        })
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    pub fn total_items(&self) -> Result<usize, AppError> {
        Ok(self.store.total()?)
    }
}

pub(crate) fn resolve_owner(owner: Option<String>) -> String {
    match owner {
        Some(owner) if !owner.trim().is_empty() => owner.trim().to_string(),
        _ => DEFAULT_OWNER.to_string(),
    }
}
