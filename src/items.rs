use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OWNER: &str = "local";
pub const DEFAULT_TITLE: &str = "Untitled capture";

const CSV_HEADERS: [&str; 13] = [
    "id",
    "owner",
    "url",
    "title",
    "source",
    "content_type",
    "content",
    "summary",
    "keywords",
    "emotion",
    "thumbnail",
    "created_at",
    "processed",
];

/// Closed set of moods an item can be filed under. Anything an
/// analyzer produces is mapped onto one of these before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Excited,
    Happy,
    Neutral,
    Thoughtful,
    Reflective,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Excited => "excited",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Thoughtful => "thoughtful",
            Emotion::Reflective => "reflective",
        }
    }

    pub fn parse(value: &str) -> Option<Emotion> {
        match value.trim().to_lowercase().as_str() {
            "excited" => Some(Emotion::Excited),
            "happy" => Some(Emotion::Happy),
            "neutral" => Some(Emotion::Neutral),
            "thoughtful" => Some(Emotion::Thoughtful),
            "reflective" => Some(Emotion::Reflective),
            _ => None,
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured memory. `content` holds the readable text the capture
/// arrived with (or the server extracted), `summary`/`keywords`/`emotion`
/// are filled in by the enrichment worker once `processed` flips to true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: u64,
    pub owner: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub content_type: String,
    pub content: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Option<Emotion>,
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

impl std::hash::Hash for Item {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Item {}

#[derive(Debug, Clone, Default)]
pub struct ItemCreate {
    pub owner: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub content_type: String,
    pub content: String,
    pub thumbnail: Option<String>,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub emotion: Option<Emotion>,
    pub thumbnail: Option<String>,
    pub processed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemQuery {
    /// Scope to one owner. `None` matches every owner.
    pub owner: Option<String>,
    /// Case-insensitive substring over title, summary and keywords.
    pub text: Option<String>,
    /// Emotion label, compared against the persisted label. An unknown
    /// label matches nothing rather than erroring.
    pub emotion: Option<String>,
    pub content_type: Option<String>,
    /// Exact match on the stored (normalized) url.
    pub url: Option<String>,
    pub processed: Option<bool>,
    pub limit: Option<usize>,
}

pub trait ItemStore: Send + Sync {
    fn create(&self, create: ItemCreate) -> anyhow::Result<Item>;
    fn update(&self, id: u64, update: ItemUpdate) -> anyhow::Result<Option<Item>>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Item>>;
    fn delete(&self, id: u64) -> anyhow::Result<bool>;
    /// Matching items, newest first.
    fn query(&self, query: ItemQuery) -> anyhow::Result<Vec<Item>>;
    fn total(&self) -> anyhow::Result<usize>;
    fn unprocessed_count(&self) -> anyhow::Result<usize>;
}

/// Flat-file store. The whole library lives in memory behind a RwLock
/// and every mutation rewrites the csv through a temp file, so a crash
/// mid-save never leaves a half-written library behind.
pub struct BackendCsv {
    list: Arc<RwLock<Vec<Item>>>,
    next_id: AtomicU64,
    path: PathBuf,
}

impl BackendCsv {
    pub fn load(path: &Path) -> anyhow::Result<BackendCsv> {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let file = OpenOptions::new().create(true).write(true).open(path)?;
                let mut wtr = csv::Writer::from_writer(file);
                wtr.write_record(CSV_HEADERS)?;
                wtr.flush()?;
                OpenOptions::new().read(true).open(path)?
            }
            Err(err) => return Err(err.into()),
        };

        let mut rdr = csv::Reader::from_reader(file);
        let mut list = vec![];
        for record in rdr.records() {
            let record = record?;
            list.push(Self::parse_row(&record)?);
        }

        // Ids are 1-based and never reused, even across restarts.
        let next_id = list.iter().map(|i| i.id + 1).max().unwrap_or(1);
        Ok(BackendCsv {
            list: Arc::new(RwLock::new(list)),
            next_id: AtomicU64::new(next_id),
            path: path.to_path_buf(),
        })
    }

    fn parse_row(record: &csv::StringRecord) -> anyhow::Result<Item> {
        let field = |idx: usize, name: &str| -> anyhow::Result<&str> {
            record
                .get(idx)
                .ok_or_else(|| anyhow!("missing csv column {name:?}"))
        };

        let created_at = DateTime::parse_from_rfc3339(field(11, "created_at")?)
            .map_err(|err| anyhow!("bad created_at: {err}"))?
            .with_timezone(&Utc);

        Ok(Item {
            id: field(0, "id")?.parse()?,
            owner: field(1, "owner")?.to_string(),
            url: field(2, "url")?.to_string(),
            title: field(3, "title")?.to_string(),
            source: field(4, "source")?.to_string(),
            content_type: field(5, "content_type")?.to_string(),
            content: field(6, "content")?.to_string(),
            summary: field(7, "summary")?.to_string(),
            keywords: field(8, "keywords")?
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
            emotion: Emotion::parse(field(9, "emotion")?),
            thumbnail: match field(10, "thumbnail")? {
                "" => None,
                t => Some(t.to_string()),
            },
            created_at,
            processed: field(12, "processed")? == "true",
        })
    }

    fn save(&self, list: &[Item]) -> anyhow::Result<()> {
        let tmp_path = {
            let mut p = self.path.clone().into_os_string();
            p.push("-tmp");
            PathBuf::from(p)
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut wtr = csv::Writer::from_writer(file);
        wtr.write_record(CSV_HEADERS)?;
        for item in list {
            wtr.write_record([
                item.id.to_string().as_str(),
                &item.owner,
                &item.url,
                &item.title,
                &item.source,
                &item.content_type,
                &item.content,
                &item.summary,
                &item.keywords.join(","),
                item.emotion.map(|e| e.as_str()).unwrap_or(""),
                item.thumbnail.as_deref().unwrap_or(""),
                &item.created_at.to_rfc3339(),
                if item.processed { "true" } else { "false" },
            ])?;
        }
        wtr.flush()?;
        let file = wtr.into_inner()?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn matches(item: &Item, query: &ItemQuery) -> bool {
        if let Some(owner) = &query.owner {
            if &item.owner != owner {
                return false;
            }
        }
        if let Some(url) = &query.url {
            if &item.url != url {
                return false;
            }
        }
        if let Some(content_type) = &query.content_type {
            if &item.content_type != content_type {
                return false;
            }
        }
        if let Some(processed) = query.processed {
            if item.processed != processed {
                return false;
            }
        }
        if let Some(emotion) = &query.emotion {
            let wanted = emotion.trim().to_lowercase();
            if item.emotion.map(|e| e.as_str().to_string()) != Some(wanted) {
                return false;
            }
        }
        if let Some(text) = &query.text {
            let needle = text.to_lowercase();
            if !needle.is_empty() {
                let hit = item.title.to_lowercase().contains(&needle)
                    || item.summary.to_lowercase().contains(&needle)
                    || item
                        .keywords
                        .iter()
                        .any(|k| k.to_lowercase().contains(&needle));
                if !hit {
                    return false;
                }
            }
        }
        true
    }
}

impl ItemStore for BackendCsv {
    fn create(&self, create: ItemCreate) -> anyhow::Result<Item> {
        let mut list = self.list.write().unwrap();
        let item = Item {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            owner: create.owner,
            url: create.url,
            title: create.title,
            source: create.source,
            content_type: create.content_type,
            content: create.content,
            summary: String::new(),
            keywords: vec![],
            emotion: None,
            thumbnail: create.thumbnail,
            created_at: Utc::now(),
            processed: false,
        };
        list.push(item.clone());
        self.save(&list)?;
        Ok(item)
    }

    fn update(&self, id: u64, update: ItemUpdate) -> anyhow::Result<Option<Item>> {
        let mut list = self.list.write().unwrap();
        let Some(item) = list.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };

        if let Some(title) = update.title {
            item.title = title;
        }
        if let Some(content) = update.content {
            item.content = content;
        }
        if let Some(summary) = update.summary {
            item.summary = summary;
        }
        if let Some(keywords) = update.keywords {
            let mut seen = HashSet::new();
            item.keywords = keywords
                .into_iter()
                .filter(|k| !k.is_empty() && seen.insert(k.clone()))
                .collect();
        }
        if let Some(emotion) = update.emotion {
            item.emotion = Some(emotion);
        }
        if let Some(thumbnail) = update.thumbnail {
            item.thumbnail = Some(thumbnail);
        }
        if let Some(processed) = update.processed {
            item.processed = processed;
        }

        let item = item.clone();
        self.save(&list)?;
        Ok(Some(item))
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Item>> {
        let list = self.list.read().unwrap();
        Ok(list.iter().find(|i| i.id == id).cloned())
    }

    fn delete(&self, id: u64) -> anyhow::Result<bool> {
        let mut list = self.list.write().unwrap();
        let before = list.len();
        list.retain(|i| i.id != id);
        if list.len() == before {
            return Ok(false);
        }
        self.save(&list)?;
        Ok(true)
    }

    fn query(&self, query: ItemQuery) -> anyhow::Result<Vec<Item>> {
        let list = self.list.read().unwrap();
        let mut found: Vec<Item> = list
            .iter()
            .filter(|item| Self::matches(item, &query))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn total(&self) -> anyhow::Result<usize> {
        Ok(self.list.read().unwrap().len())
    }

    fn unprocessed_count(&self) -> anyhow::Result<usize> {
        Ok(self
            .list
            .read()
            .unwrap()
            .iter()
            .filter(|i| !i.processed)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (BackendCsv, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendCsv::load(&dir.path().join("items.csv")).unwrap();
        (backend, dir)
    }

    fn sample(owner: &str, url: &str) -> ItemCreate {
        ItemCreate {
            owner: owner.to_string(),
            url: url.to_string(),
            title: "A title".to_string(),
            source: "example.com".to_string(),
            content_type: "web".to_string(),
            content: "Some readable text.".to_string(),
            thumbnail: None,
        }
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let (store, _dir) = store();
        let a = store.create(sample("local", "https://example.com/a")).unwrap();
        let b = store.create(sample("local", "https://example.com/b")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(!a.processed);
        assert!(a.summary.is_empty());
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let (store, _dir) = store();
        store.create(sample("local", "https://example.com/a")).unwrap();
        let b = store.create(sample("local", "https://example.com/b")).unwrap();
        assert!(store.delete(b.id).unwrap());
        let c = store.create(sample("local", "https://example.com/c")).unwrap();
        assert_eq!(c.id, b.id + 1);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        {
            let store = BackendCsv::load(&path).unwrap();
            let item = store.create(sample("local", "https://example.com/a")).unwrap();
            store
                .update(
                    item.id,
                    ItemUpdate {
                        summary: Some("A short summary.".to_string()),
                        keywords: Some(vec!["rust".to_string(), "memory".to_string()]),
                        emotion: Some(Emotion::Happy),
                        processed: Some(true),
                        ..Default::default()
                    },
                )
                .unwrap()
                .unwrap();
        }

        let store = BackendCsv::load(&path).unwrap();
        let item = store.get(1).unwrap().unwrap();
        assert_eq!(item.summary, "A short summary.");
        assert_eq!(item.keywords, vec!["rust", "memory"]);
        assert_eq!(item.emotion, Some(Emotion::Happy));
        assert!(item.processed);
    }

    #[test]
    fn survives_csv_hostile_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        let text = "line one\nline two, \"quoted\", done";
        {
            let store = BackendCsv::load(&path).unwrap();
            let mut create = sample("local", "https://example.com/a");
            create.content = text.to_string();
            store.create(create).unwrap();
        }
        let store = BackendCsv::load(&path).unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().content, text);
    }

    #[test]
    fn update_missing_returns_none() {
        let (store, _dir) = store();
        let out = store
            .update(42, ItemUpdate { processed: Some(true), ..Default::default() })
            .unwrap();
        assert!(out.is_none());
        assert!(!store.delete(42).unwrap());
    }

    #[test]
    fn update_deduplicates_keywords() {
        let (store, _dir) = store();
        let item = store.create(sample("local", "https://example.com/a")).unwrap();
        let updated = store
            .update(
                item.id,
                ItemUpdate {
                    keywords: Some(vec![
                        "rust".to_string(),
                        "rust".to_string(),
                        "memory".to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.keywords, vec!["rust", "memory"]);
    }

    #[test]
    fn query_filters_and_sorts_newest_first() {
        let (store, _dir) = store();
        let a = store.create(sample("local", "https://example.com/a")).unwrap();
        let b = store.create(sample("local", "https://example.com/b")).unwrap();
        store.create(sample("other", "https://example.com/c")).unwrap();

        store
            .update(
                a.id,
                ItemUpdate {
                    summary: Some("Notes about rust ownership.".to_string()),
                    emotion: Some(Emotion::Neutral),
                    processed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let all = store
            .query(ItemQuery { owner: Some("local".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b.id, "newest item comes first");

        let hits = store
            .query(ItemQuery {
                owner: Some("local".to_string()),
                text: Some("RUST".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);

        let none = store
            .query(ItemQuery {
                emotion: Some("angry".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty(), "unknown emotion label matches nothing");
    }

    #[test]
    fn query_matches_keywords_and_url() {
        let (store, _dir) = store();
        let item = store.create(sample("local", "https://example.com/a")).unwrap();
        store
            .update(
                item.id,
                ItemUpdate {
                    keywords: Some(vec!["ownership".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();

        let by_keyword = store
            .query(ItemQuery { text: Some("owner".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(by_keyword.len(), 1);

        let by_url = store
            .query(ItemQuery {
                url: Some("https://example.com/a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_url.len(), 1);
    }

    #[test]
    fn unprocessed_count_tracks_worker_progress() {
        let (store, _dir) = store();
        let a = store.create(sample("local", "https://example.com/a")).unwrap();
        store.create(sample("local", "https://example.com/b")).unwrap();
        assert_eq!(store.unprocessed_count().unwrap(), 2);

        store
            .update(a.id, ItemUpdate { processed: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(store.unprocessed_count().unwrap(), 1);
        assert_eq!(store.total().unwrap(), 2);
    }
}
