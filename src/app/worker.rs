//! Enrichment worker pool. One dispatcher thread drains the job
//! channel and spawns a short-lived thread per job, throttled to the
//! configured width. A failed job is logged and dropped, never retried:
//! the item simply stays unprocessed and visible as such in status.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::sleep;
use std::time::Duration;

use anyhow::anyhow;

use crate::config::Config;
use crate::enrich::Analyzer;
use crate::items::{ItemStore, ItemUpdate};
use crate::semantic::{SemanticSearchError, TagSemantics};

#[derive(Clone, Debug)]
pub enum Job {
    Enrich { item_id: u64 },
    Shutdown,
}

/// Item ids that are queued or being worked on right now. Guarded by
/// the ingest path so one item never has two enrichment jobs in flight.
pub type PendingJobs = Arc<Mutex<HashSet<u64>>>;

pub fn throttle(counter: &Arc<AtomicU16>, config: &Arc<RwLock<Config>>) {
    while counter.load(Ordering::Relaxed) >= config.read().unwrap().worker_threads {
        sleep(Duration::from_millis(100));
    }
}

/// Dispatcher loop. Runs until a `Shutdown` job arrives, then waits for
/// every in-flight thread before returning. Jobs queued ahead of the
/// shutdown sentinel are still processed.
pub fn start_pool(
    job_rx: mpsc::Receiver<Job>,
    store: Arc<dyn ItemStore>,
    analyzer: Arc<dyn Analyzer>,
    semantic: Arc<dyn TagSemantics>,
    pending: PendingJobs,
    config: Arc<RwLock<Config>>,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));

    while let Ok(job) = job_rx.recv() {
        let item_id = match job {
            Job::Shutdown => {
                while thread_ctr.load(Ordering::Relaxed) > 0 {
                    sleep(Duration::from_millis(100));
                }
                log::info!("enrichment pool stopped");
                return;
            }
            Job::Enrich { item_id } => item_id,
        };

        // Counted before the spawn so a shutdown sentinel right behind
        // this job can never observe zero in-flight threads.
        throttle(&thread_ctr, &config);
        thread_ctr.fetch_add(1, Ordering::Relaxed);

        let job_handle = std::thread::spawn({
            let store = store.clone();
            let analyzer = analyzer.clone();
            let semantic = semantic.clone();
            let config = config.clone();
            move || {
                if let Err(err) = enrich_item(item_id, &store, &analyzer, &semantic, &config) {
                    log::error!("enrichment of item {item_id} failed: {err}");
                }
            }
        });

        // Watcher survives a panicking job so the counter and the
        // pending set always come back down.
        let pending = pending.clone();
        let thread_counter = thread_ctr.clone();
        std::thread::spawn(move || {
            if let Err(err) = job_handle.join() {
                log::error!("enrichment worker panicked: {err:?}");
            }
            pending.lock().unwrap().remove(&item_id);
            thread_counter.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Load, analyze, persist. The enrichment fields and the processed flag
/// land in one store update so readers never observe a half-enriched
/// item.
pub fn enrich_item(
    item_id: u64,
    store: &Arc<dyn ItemStore>,
    analyzer: &Arc<dyn Analyzer>,
    semantic: &Arc<dyn TagSemantics>,
    config: &Arc<RwLock<Config>>,
) -> anyhow::Result<()> {
    let item = store
        .get(item_id)?
        .ok_or_else(|| anyhow!("item {item_id} no longer exists"))?;

    let enrichment = analyzer.analyze(&item.content);

    let (summary_max, keywords_max) = {
        let config = config.read().unwrap();
        (
            config.analyzer.summary_max_len,
            config.analyzer.keywords_limit,
        )
    };
    let enrichment = enrichment.clamped(summary_max, keywords_max);

    store
        .update(
            item_id,
            ItemUpdate {
                summary: Some(enrichment.summary),
                keywords: Some(enrichment.keywords.clone()),
                emotion: Some(enrichment.emotion),
                processed: Some(true),
                ..Default::default()
            },
        )?
        .ok_or_else(|| anyhow!("item {item_id} disappeared during enrichment"))?;

    if !enrichment.keywords.is_empty() {
        match semantic.ensure_tags(&enrichment.keywords) {
            Ok(_) | Err(SemanticSearchError::Disabled) => {}
            Err(err) => log::warn!("tag embedding upsert failed: {err}"),
        }
    }

    log::debug!("item {item_id} enriched");
    Ok(())
}
