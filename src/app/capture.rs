//! Capture ingestion: request shaping, the dedup window and the
//! decision between returning an existing item, overwriting it, or
//! persisting a fresh one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{resolve_owner, worker, App, AppError};
use crate::extract::is_sufficient;
use crate::items::{Item, ItemCreate, ItemQuery, ItemUpdate, DEFAULT_TITLE};

// Expired stamps are swept once the map grows past this.
const DEDUP_SWEEP_THRESHOLD: usize = 1024;

const TRACKING_PARAMS: [&str; 10] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
    "mc_cid",
    "mc_eid",
];

/// What a browser extension (or the cli) sends to capture a page.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureRequest {
    pub owner: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub content: Option<String>,
    /// Highlighted text, used when `content` is absent.
    pub selection: Option<String>,
    pub thumbnail: Option<String>,
    /// When false the server never fetches the url itself and the
    /// supplied content is treated as authoritative.
    pub allow_server_extract: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        CaptureRequest {
            owner: None,
            url: None,
            title: None,
            source: None,
            content_type: None,
            mime_type: None,
            content: None,
            selection: None,
            thumbnail: None,
            allow_server_extract: true,
        }
    }
}

// Page text and data-url thumbnails are too bulky for request logs.
impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn chars(value: &Option<String>) -> usize {
            value.as_deref().map(|v| v.chars().count()).unwrap_or(0)
        }
        write!(
            f,
            "CaptureRequest {{ owner: {:?}, url: {:?}, title: {:?}, source: {:?}, \
             content_type: {:?}, mime_type: {:?}, content: [{} chars], \
             selection: [{} chars], thumbnail: [{} chars], allow_server_extract: {:?} }}",
            self.owner,
            self.url,
            self.title,
            self.source,
            self.content_type,
            self.mime_type,
            chars(&self.content),
            chars(&self.selection),
            chars(&self.thumbnail),
            self.allow_server_extract,
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutcome {
    pub item: Item,
    /// Readable text of sufficient length is present on the item.
    pub extracted: bool,
    /// An enrichment job is queued. False when enrichment already ran
    /// synchronously or the item came back unchanged.
    pub queued: bool,
}

/// Per (owner, normalized url) capture window. `hit` checks and stamps
/// under one lock, which is all the serialization captures get: racing
/// first captures of the same url are accepted best-effort rather than
/// strictly locked out.
pub struct DedupCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> DedupCache {
        DedupCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True when the key was stamped within the ttl window. A miss
    /// stamps the key before releasing the lock.
    pub fn hit(&self, owner: &str, url: &str) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if entries.len() > DEDUP_SWEEP_THRESHOLD {
            entries.retain(|_, stamped| now.duration_since(*stamped) < self.ttl);
        }

        let key = (owner.to_string(), url.to_string());
        match entries.get(&key) {
            Some(stamped) if now.duration_since(*stamped) < self.ttl => true,
            _ => {
                entries.insert(key, now);
                false
            }
        }
    }
}

impl App {
    pub fn capture(&self, request: CaptureRequest) -> Result<CaptureOutcome, AppError> {
        let owner = resolve_owner(request.owner.clone());
        let url = non_empty(request.url.as_deref()).map(|u| normalize_url(&u));
        let supplied = first_non_empty([request.content.as_deref(), request.selection.as_deref()]);

        if url.is_none() && supplied.is_none() {
            return Err(AppError::invalid("capture needs a url or some content"));
        }

        if let Some(url) = &url {
            if self.dedup.hit(&owner, url) {
                let existing = self
                    .store
                    .query(ItemQuery {
                        owner: Some(owner.clone()),
                        url: Some(url.clone()),
                        limit: Some(1),
                        ..Default::default()
                    })?
                    .into_iter()
                    .next();
                match existing {
                    Some(existing) => return self.recapture(existing, &request, supplied),
                    // The window was stamped but nothing is persisted:
                    // a racing first capture. Persist this one as fresh.
                    None => log::debug!("dedup window hit for {url} with no stored item"),
                }
            }
        }

        self.fresh_capture(owner, url, request, supplied)
    }

    fn recapture(
        &self,
        existing: Item,
        request: &CaptureRequest,
        supplied: Option<String>,
    ) -> Result<CaptureOutcome, AppError> {
        // A client that turned off server extraction and sent its own
        // text is authoritative: overwrite and enrich again.
        if !request.allow_server_extract {
            if let Some(content) = supplied {
                let updated = self
                    .store
                    .update(
                        existing.id,
                        ItemUpdate {
                            content: Some(content),
                            processed: Some(false),
                            ..Default::default()
                        },
                    )?
                    .ok_or(AppError::NotFound)?;
                log::info!("item {} content overwritten by re-capture", updated.id);
                let (item, queued) = self.finish_enrichment(updated)?;
                let extracted = is_sufficient(&item.content);
                return Ok(CaptureOutcome { item, extracted, queued });
            }
        }

        log::debug!("duplicate capture of item {} inside the dedup window", existing.id);
        let extracted = is_sufficient(&existing.content);
        Ok(CaptureOutcome {
            item: existing,
            extracted,
            queued: false,
        })
    }

    fn fresh_capture(
        &self,
        owner: String,
        url: Option<String>,
        request: CaptureRequest,
        supplied: Option<String>,
    ) -> Result<CaptureOutcome, AppError> {
        let mut title = non_empty(request.title.as_deref());
        let mut content = supplied.unwrap_or_default();

        if request.allow_server_extract && content.is_empty() {
            if let Some(url) = &url {
                let extraction = self.extractor.extract(url);
                content = extraction.text;
                if title.is_none() {
                    title = extraction.title;
                }
            }
        }

        let source =
            non_empty(request.source.as_deref()).unwrap_or_else(|| derive_source(url.as_deref()));
        let content_type = non_empty(request.content_type.as_deref())
            .unwrap_or_else(|| infer_content_type(request.mime_type.as_deref()));

        let item = self.store.create(ItemCreate {
            owner,
            url: url.unwrap_or_default(),
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            source,
            content_type,
            content,
            thumbnail: non_empty(request.thumbnail.as_deref()),
        })?;
        log::info!("captured item {} from {:?}", item.id, item.source);

        let (item, queued) = self.finish_enrichment(item)?;
        let extracted = is_sufficient(&item.content);
        Ok(CaptureOutcome { item, extracted, queued })
    }

    /// Queue when the pool is up, otherwise enrich inline so one-shot
    /// cli captures come back complete.
    fn finish_enrichment(&self, item: Item) -> Result<(Item, bool), AppError> {
        if self.queue_running() {
            let queued = self.enqueue_enrichment(item.id);
            return Ok((item, queued));
        }

        if let Err(err) =
            worker::enrich_item(item.id, &self.store, &self.analyzer, &self.semantic, &self.config)
        {
            log::error!("enrichment of item {} failed: {err}", item.id);
            return Ok((item, false));
        }
        let item = self.store.get(item.id)?.unwrap_or(item);
        Ok((item, false))
    }
}

/// Canonical form used both as the dedup key and as the stored url:
/// fragment dropped, tracking parameters removed, trailing slash
/// trimmed. Unparseable input is kept verbatim.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    // Protocol-relative urls from lazy clients.
    let candidate = if trimmed.starts_with("//") {
        format!("https:{trimmed}")
    } else {
        trimmed.to_string()
    };

    let Ok(mut url) = url::Url::parse(&candidate) else {
        return trimmed.to_string();
    };

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut out = url.to_string();
    if out.ends_with('/') && url.path() != "/" {
        out.pop();
    }
    out
}

/// Hostname with a leading `www.` stripped, `unknown` when the url is
/// absent or hostless.
pub fn derive_source(url: Option<&str>) -> String {
    url.and_then(|u| url::Url::parse(u.trim()).ok())
        .and_then(|u| {
            u.host_str()
                .map(|h| h.strip_prefix("www.").unwrap_or(h).to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn infer_content_type(mime_type: Option<&str>) -> String {
    let mime = mime_type.unwrap_or("").to_lowercase();
    if mime.contains("video") {
        "video"
    } else if mime.contains("image") {
        "image"
    } else if mime.contains("pdf") {
        "document"
    } else {
        "web"
    }
    .to_string()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn first_non_empty(candidates: [Option<&str>; 2]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(String::from)
}
