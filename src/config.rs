use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::{DEFAULT_MODEL, DEFAULT_THRESHOLD};

const WORKER_THREADS: u16 = 4;
const DEDUP_TTL_SECS: u64 = 60;
const LISTEN_ADDR: &str = "0.0.0.0:8080";
const SEARCH_LIMIT: usize = 25;

const FETCH_TIMEOUT_SECS: u64 = 12;
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";

const ANALYZER_TIMEOUT_SECS: u64 = 10;
const SUMMARY_MAX_LEN: usize = 400;
const KEYWORDS_LIMIT: usize = 8;

/// Default model download timeout in seconds
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Outbound fetch policy for server-side extraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,

    /// Hostnames that are never fetched, compared case-insensitively.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Refuse urls whose host resolves to loopback, RFC1918, link-local
    /// or ULA space. Captures come from untrusted browsers, so this is
    /// on by default.
    #[serde(default = "default_true")]
    pub block_private_ips: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: FETCH_TIMEOUT_SECS,
            user_agent: USER_AGENT.to_string(),
            allowed_schemes: default_allowed_schemes(),
            blocked_hosts: vec![],
            block_private_ips: true,
        }
    }
}

/// Enrichment analyzer selection. Without an endpoint the built-in
/// heuristics run; with one, the remote service is tried first and the
/// heuristics remain the fallback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_analyzer_timeout_secs")]
    pub timeout_secs: u64,

    /// Hard cap on summary length in characters.
    #[serde(default = "default_summary_max_len")]
    pub summary_max_len: usize,

    /// Hard cap on the number of keywords per item.
    #[serde(default = "default_keywords_limit")]
    pub keywords_limit: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: ANALYZER_TIMEOUT_SECS,
            summary_max_len: SUMMARY_MAX_LEN,
            keywords_limit: KEYWORDS_LIMIT,
        }
    }
}

/// Configuration for semantic tag expansion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Enable or disable semantic expansion
    #[serde(default)]
    pub enabled: bool,

    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Default similarity threshold [0.0, 1.0]
    #[serde(default = "default_semantic_threshold")]
    pub default_threshold: f32,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: DEFAULT_MODEL.to_string(),
            default_threshold: DEFAULT_THRESHOLD,
            download_timeout_secs: DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: u16,

    /// Capture dedup window in seconds. 0 disables the window entirely.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: WORKER_THREADS,
            dedup_ttl_secs: DEDUP_TTL_SECS,
            listen_addr: LISTEN_ADDR.to_string(),
            search_limit: SEARCH_LIMIT,
            fetch: FetchConfig::default(),
            analyzer: AnalyzerConfig::default(),
            semantic_search: SemanticSearchConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_worker_threads() -> u16 {
    WORKER_THREADS
}

fn default_dedup_ttl_secs() -> u64 {
    DEDUP_TTL_SECS
}

fn default_listen_addr() -> String {
    LISTEN_ADDR.to_string()
}

fn default_search_limit() -> usize {
    SEARCH_LIMIT
}

fn default_fetch_timeout_secs() -> u64 {
    FETCH_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}

fn default_allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_analyzer_timeout_secs() -> u64 {
    ANALYZER_TIMEOUT_SECS
}

fn default_summary_max_len() -> usize {
    SUMMARY_MAX_LEN
}

fn default_keywords_limit() -> usize {
    KEYWORDS_LIMIT
}

fn default_semantic_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_semantic_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_download_timeout_secs() -> u64 {
    DOWNLOAD_TIMEOUT_SECS
}

impl Config {
    fn validate(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.search_limit == 0 {
            self.search_limit = SEARCH_LIMIT;
        }

        if self.fetch.timeout_secs == 0 {
            panic!("fetch.timeout_secs must be greater than 0");
        }
        if self.fetch.allowed_schemes.is_empty() {
            panic!("fetch.allowed_schemes must not be empty");
        }

        if self.analyzer.timeout_secs == 0 {
            panic!("analyzer.timeout_secs must be greater than 0");
        }
        if self.analyzer.summary_max_len == 0 {
            panic!("analyzer.summary_max_len must be greater than 0");
        }
        if self.analyzer.keywords_limit == 0 {
            panic!("analyzer.keywords_limit must be greater than 0");
        }

        let sem = &self.semantic_search;
        if !(0.0..=1.0).contains(&sem.default_threshold) {
            panic!(
                "semantic_search.default_threshold must be between 0.0 and 1.0, got {}",
                sem.default_threshold
            );
        }
        if sem.download_timeout_secs == 0 {
            panic!("semantic_search.download_timeout_secs must be greater than 0");
        }
    }

    pub fn load_with(base_path: &Path) -> Self {
        let path = base_path.join("config.yaml");

        // create new if does not exist
        if !path.exists() {
            let rendered =
                serde_yml::to_string(&Self::default()).expect("default config serializes");
            write_atomic(&path, rendered.as_bytes()).expect("cannot write initial config");
        }

        let config_str = std::fs::read_to_string(&path).expect("config file is not valid utf8");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();

        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).expect("config serializes") {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let rendered = serde_yml::to_string(&self).expect("config serializes");
        if let Err(err) = write_atomic(&self.base_path.join("config.yaml"), rendered.as_bytes()) {
            log::error!("config save failed: {err}");
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = {
        let mut p = path.to_path_buf().into_os_string();
        p.push("-tmp");
        PathBuf::from(p)
    };
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}

/// Resolve the data directory, creating it when needed. `MNEMO_BASE_PATH`
/// wins, otherwise `~/.local/share/mnemo`.
pub fn base_path() -> PathBuf {
    let path = match std::env::var("MNEMO_BASE_PATH") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => homedir::my_home()
            .ok()
            .flatten()
            .map(|home| home.join(".local").join("share").join("mnemo"))
            .expect("cannot locate a home directory, set MNEMO_BASE_PATH"),
    };
    std::fs::create_dir_all(&path).expect("cannot create data directory");
    path
}
