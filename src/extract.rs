//! Server-side page fetching and readable-text extraction. Fetching is
//! policy-guarded so a capture request cannot be used to probe internal
//! networks, and every failure mode collapses into an empty extraction
//! instead of an error.

use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::config::FetchConfig;

/// Extracted text shorter than this is considered insufficient and the
/// item stays thin until someone re-captures it with real content.
pub const SUFFICIENT_TEXT_LEN: usize = 200;

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static CONTAINER_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article, main, [role=\"main\"]").unwrap());
static PARAGRAPH_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());
static BODY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

// Subtrees that never hold readable article text.
const SKIPPED_ELEMENTS: [&str; 10] = [
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form", "svg",
];

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    /// Page title recovered from `<title>`, when present.
    pub title: Option<String>,
    pub sufficient: bool,
}

pub fn is_sufficient(text: &str) -> bool {
    text.chars().count() >= SUFFICIENT_TEXT_LEN
}

pub struct Extractor {
    config: FetchConfig,
}

impl Extractor {
    pub fn new(config: FetchConfig) -> Extractor {
        Extractor { config }
    }

    /// Fetch and extract. Network errors, policy rejections, non-html
    /// responses and unparseable pages all come back as an empty,
    /// insufficient extraction.
    pub fn extract(&self, url: &str) -> Extraction {
        match self.fetch_html(url) {
            Some(html) => extract_from_html(&html),
            None => Extraction::default(),
        }
    }

    fn fetch_html(&self, url: &str) -> Option<String> {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(err) => {
                log::warn!("{url}: not a fetchable url: {err}");
                return None;
            }
        };
        if let Err(reason) = validate_url_policy(&parsed, &self.config) {
            log::warn!("{url}: fetch refused: {reason}");
            return None;
        }

        let client = match reqwest::blocking::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                log::error!("http client init failed: {err}");
                return None;
            }
        };

        let response = match client.get(parsed).send() {
            Ok(r) => r,
            Err(err) => {
                log::warn!("{url}: fetch failed: {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            log::debug!("{url}: fetch returned {}", response.status());
            return None;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("text/html") {
            log::debug!("{url}: skipping non-html content type {content_type:?}");
            return None;
        }

        match response.text() {
            Ok(body) => Some(body),
            Err(err) => {
                log::warn!("{url}: reading body failed: {err}");
                None
            }
        }
    }
}

/// Two-pass extraction: an article-shaped pass over semantic containers
/// and paragraphs first, then a permissive whole-body sweep when that
/// comes up short. The longer result wins.
pub fn extract_from_html(html: &str) -> Extraction {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let mut text = article_text(&document);
    if !is_sufficient(&text) {
        let fallback = body_text(&document);
        if fallback.chars().count() > text.chars().count() {
            text = fallback;
        }
    }

    let sufficient = is_sufficient(&text);
    Extraction { text, title, sufficient }
}

fn article_text(document: &Html) -> String {
    if let Some(container) = document.select(&CONTAINER_SELECTOR).next() {
        let text = element_text(container);
        if !text.is_empty() {
            return text;
        }
    }

    let mut blocks = vec![];
    for paragraph in document.select(&PARAGRAPH_SELECTOR) {
        let block = element_text(paragraph);
        if !block.is_empty() {
            blocks.push(block);
        }
    }
    blocks.join("\n")
}

fn body_text(document: &Html) -> String {
    match document.select(&BODY_SELECTOR).next() {
        Some(body) => element_text(body),
        None => String::new(),
    }
}

fn element_text(element: ElementRef) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    collapse_whitespace(&out)
}

fn collect_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            scraper::Node::Text(text) => {
                out.push_str(&text.text);
                out.push(' ');
            }
            scraper::Node::Element(el) => {
                if SKIPPED_ELEMENTS.contains(&el.name()) {
                    continue;
                }
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect_text(child_element, out);
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn validate_url_policy(url: &url::Url, config: &FetchConfig) -> Result<(), String> {
    if !config
        .allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(url.scheme()))
    {
        return Err(format!("scheme {:?} not allowed", url.scheme()));
    }

    let Some(host) = url.host_str() else {
        return Err("url has no host".to_string());
    };
    let host_lower = host.to_lowercase();
    if config
        .blocked_hosts
        .iter()
        .any(|blocked| host_lower == blocked.to_lowercase())
    {
        return Err(format!("host {host:?} is blocked"));
    }

    if config.block_private_ips && resolves_to_private_ip(url) {
        return Err(format!("host {host:?} resolves to a private address"));
    }

    Ok(())
}

fn is_ip_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

fn resolves_to_private_ip(url: &url::Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    // Literal addresses short-circuit the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_ip_private(ip);
    }
    let port = url.port_or_known_default().unwrap_or(443);
    match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).any(is_ip_private),
        // Unresolvable hosts fail later at fetch time.
        Err(_) => false,
    }
}
