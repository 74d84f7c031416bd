//! Local enrichment pipeline. Produces a summary, ranked keywords and a
//! mood label for captured text without calling out to anything, plus an
//! optional remote analyzer that falls back to the local heuristics on
//! any failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AnalyzerConfig;
use crate::items::Emotion;

pub const KEYWORDS_LIMIT: usize = 8;
const SUMMARY_SINGLE_MAX: usize = 280;
const SUMMARY_PAIR_MAX: usize = 400;

static WORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z\-']+").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "the", "and", "with", "that", "have", "this", "from", "your", "about",
        "would", "there", "could", "which", "their", "what", "when", "where",
        "were", "been", "into", "also", "more", "than", "because", "other",
        "while", "just", "like", "some", "very", "such", "those", "over",
        "each", "make", "made", "after", "before", "through", "them", "they",
        "will", "between", "might", "only", "even", "does", "every", "across",
    ])
});

static NEGATORS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "not", "no", "never", "none", "nothing", "neither", "nor", "cannot",
        "can't", "won't", "don't", "doesn't", "didn't", "isn't", "wasn't",
        "aren't", "couldn't", "wouldn't",
    ])
});

// Small valence table in the VADER spirit, enough to separate the five
// moods on everyday article prose.
static VALENCE: Lazy<HashMap<&'static str, f32>> = Lazy::new(|| {
    HashMap::from([
        ("good", 1.9),
        ("great", 3.1),
        ("excellent", 2.7),
        ("amazing", 2.8),
        ("awesome", 3.1),
        ("love", 3.2),
        ("loved", 2.9),
        ("wonderful", 2.7),
        ("best", 3.2),
        ("happy", 2.7),
        ("fantastic", 2.6),
        ("brilliant", 2.8),
        ("beautiful", 2.9),
        ("enjoy", 2.2),
        ("enjoyed", 2.3),
        ("excited", 2.4),
        ("exciting", 2.2),
        ("thrilled", 2.9),
        ("delightful", 2.9),
        ("win", 2.8),
        ("success", 2.7),
        ("successful", 2.6),
        ("improve", 1.9),
        ("improved", 2.1),
        ("better", 1.9),
        ("perfect", 2.7),
        ("nice", 1.8),
        ("fun", 2.3),
        ("interesting", 1.7),
        ("impressive", 2.3),
        ("innovative", 1.8),
        ("breakthrough", 2.1),
        ("bad", -2.5),
        ("terrible", -2.1),
        ("awful", -2.0),
        ("horrible", -2.5),
        ("hate", -2.7),
        ("worst", -3.1),
        ("sad", -2.1),
        ("angry", -2.3),
        ("fail", -2.3),
        ("failed", -2.3),
        ("failure", -2.4),
        ("problem", -1.7),
        ("problems", -1.7),
        ("crisis", -2.0),
        ("death", -2.9),
        ("war", -2.9),
        ("disaster", -3.1),
        ("fear", -2.2),
        ("loss", -1.3),
        ("wrong", -2.1),
        ("difficult", -1.5),
        ("poor", -2.1),
        ("broken", -1.6),
        ("threat", -1.9),
        ("dangerous", -2.4),
        ("concern", -1.1),
        ("concerned", -1.1),
        ("worried", -1.9),
        ("worry", -1.9),
        ("disappointing", -2.2),
        ("pain", -2.0),
    ])
});

// Dampened flip applied to a valence word preceded by a negator.
const NEGATION_SCALAR: f32 = -0.74;
const NEGATION_WINDOW: usize = 3;
// Normalization constant for the compound score.
const SIGMOID_ALPHA: f32 = 15.0;

/// Everything an analyzer derives from one piece of text. The sentiment
/// score only drives the emotion label and is not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub summary: String,
    pub keywords: Vec<String>,
    pub emotion: Emotion,
    pub sentiment_score: f32,
}

impl Enrichment {
    /// Enforce output bounds no matter which analyzer produced the values.
    pub fn clamped(mut self, summary_max: usize, keywords_max: usize) -> Enrichment {
        self.summary = truncate_chars(self.summary.trim(), summary_max);
        let mut seen = HashSet::new();
        self.keywords = self
            .keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .take(keywords_max)
            .collect();
        self.sentiment_score = self.sentiment_score.clamp(-1.0, 1.0);
        self
    }
}

pub trait Analyzer: Send + Sync {
    /// Never fails and always terminates; garbage in, neutral out.
    fn analyze(&self, text: &str) -> Enrichment;
}

pub fn from_config(config: &AnalyzerConfig) -> Arc<dyn Analyzer> {
    match &config.endpoint {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            match RemoteAnalyzer::new(endpoint.clone(), Duration::from_secs(config.timeout_secs)) {
                Ok(remote) => Arc::new(remote),
                Err(err) => {
                    log::warn!("remote analyzer unavailable ({err}), using local heuristics");
                    Arc::new(HeuristicAnalyzer)
                }
            }
        }
        _ => Arc::new(HeuristicAnalyzer),
    }
}

/// Deterministic, dependency-free analyzer. This is the default and the
/// fallback for the remote one.
pub struct HeuristicAnalyzer;

impl Analyzer for HeuristicAnalyzer {
    fn analyze(&self, text: &str) -> Enrichment {
        let score = sentiment_score(text);
        Enrichment {
            summary: summarize(text),
            keywords: extract_keywords(text, KEYWORDS_LIMIT),
            emotion: emotion_for(score),
            sentiment_score: score,
        }
    }
}

/// Posts `{"text": ...}` to a configured endpoint and expects an
/// enrichment object back. Any transport, status or decode failure
/// degrades to [`HeuristicAnalyzer`] instead of surfacing an error.
pub struct RemoteAnalyzer {
    endpoint: String,
    client: reqwest::blocking::Client,
    fallback: HeuristicAnalyzer,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    sentiment_score: Option<f32>,
}

impl RemoteAnalyzer {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<RemoteAnalyzer> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(RemoteAnalyzer {
            endpoint,
            client,
            fallback: HeuristicAnalyzer,
        })
    }

    fn request(&self, text: &str) -> anyhow::Result<Enrichment> {
        let reply: RemoteReply = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()?
            .error_for_status()?
            .json()?;

        let score = reply.sentiment_score.unwrap_or(0.0);
        let emotion = reply
            .emotion
            .as_deref()
            .and_then(Emotion::parse)
            .unwrap_or_else(|| emotion_for(score));
        let summary = if reply.summary.trim().is_empty() {
            summarize(text)
        } else {
            reply.summary
        };
        let keywords = if reply.keywords.is_empty() {
            extract_keywords(text, KEYWORDS_LIMIT)
        } else {
            reply.keywords
        };

        Ok(Enrichment {
            summary,
            keywords,
            emotion,
            sentiment_score: score,
        })
    }
}

impl Analyzer for RemoteAnalyzer {
    fn analyze(&self, text: &str) -> Enrichment {
        match self.request(text) {
            Ok(enrichment) => enrichment,
            Err(err) => {
                log::warn!("remote analyzer failed, using local heuristics: {err}");
                self.fallback.analyze(text)
            }
        }
    }
}

/// First one or two sentences, capped by character count. A text without
/// sentence punctuation is truncated as-is.
pub fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    let sentences = split_sentences(trimmed);
    match sentences.len() {
        0 => truncate_chars(trimmed, SUMMARY_SINGLE_MAX),
        1 => truncate_chars(sentences[0], SUMMARY_SINGLE_MAX),
        _ => {
            let pair = format!("{} {}", sentences[0], sentences[1]);
            truncate_chars(&pair, SUMMARY_PAIR_MAX)
        }
    }
}

/// Lowercased word tokens ranked by frequency, stopwords and short
/// tokens removed, ties broken by first occurrence. When filtering
/// leaves nothing the raw tokens are used so short inputs still get
/// keywords.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let words: Vec<String> = WORD_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let filtered: Vec<&str> = words
        .iter()
        .map(String::as_str)
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .collect();

    let ranked = if filtered.is_empty() {
        words.iter().map(String::as_str).collect()
    } else {
        rank_by_frequency(filtered)
    };

    let mut seen = HashSet::new();
    ranked
        .into_iter()
        .filter(|w| seen.insert(w.to_string()))
        .take(limit)
        .map(String::from)
        .collect()
}

fn rank_by_frequency(words: Vec<&str>) -> Vec<&str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = vec![];
    for word in words {
        let count = counts.entry(word).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }
    // Stable sort keeps first-occurrence order between equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order
}

/// Compound score in [-1, 1]. Zero for text with no valence words.
pub fn sentiment_score(text: &str) -> f32 {
    let tokens: Vec<String> = WORD_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let mut sum = 0f32;
    for (idx, token) in tokens.iter().enumerate() {
        let Some(&valence) = VALENCE.get(token.as_str()) else {
            continue;
        };
        let window_start = idx.saturating_sub(NEGATION_WINDOW);
        let negated = tokens[window_start..idx]
            .iter()
            .any(|t| NEGATORS.contains(t.as_str()));
        sum += if negated { valence * NEGATION_SCALAR } else { valence };
    }

    if sum == 0.0 {
        return 0.0;
    }
    let compound = sum / (sum * sum + SIGMOID_ALPHA).sqrt();
    compound.clamp(-1.0, 1.0)
}

pub fn emotion_for(compound: f32) -> Emotion {
    if compound >= 0.6 {
        Emotion::Excited
    } else if compound >= 0.2 {
        Emotion::Happy
    } else if compound >= -0.1 {
        Emotion::Neutral
    } else if compound >= -0.3 {
        Emotion::Thoughtful
    } else {
        Emotion::Reflective
    }
}

/// Split after runs of `.` `!` `?` followed by spaces. The separator
/// spaces are consumed, the punctuation stays with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut sentences = vec![];
    let mut start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        if matches!(bytes[idx], b'.' | b'!' | b'?') {
            let mut end = idx + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'!' | b'?') {
                end += 1;
            }
            let mut next = end;
            while next < bytes.len() && bytes[next] == b' ' {
                next += 1;
            }
            if next > end {
                sentences.push(&text[start..end]);
                start = next;
                idx = next;
                continue;
            }
            idx = end;
            continue;
        }
        idx += 1;
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
