//! Deterministic citation extraction.
//!
//! Every `http(s)` URL in a response is normalized (no `www.`, no `utm_*`
//! parameters, no fragment, no trailing slash), de-duplicated, and classified
//! `primary` when it shares a base domain with one of the org's websites.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use brandlens_common::CitationKind;

use crate::traits::ExtractedCitation;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"'`\)\]\}]+"#).unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".svg", ".webp"];

/// Second-level registry suffixes where the registrable domain has three labels.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.nz", "co.jp",
    "co.in", "co.za", "com.br", "com.mx", "com.sg", "com.cn",
];

/// Raw URL matches in order of appearance, trailing punctuation trimmed.
pub fn find_urls(text: &str) -> Vec<&str> {
    URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']))
        .collect()
}

pub fn extract_citations(text: &str, org_websites: &[String]) -> Vec<ExtractedCitation> {
    let org_domains: HashSet<String> = org_websites
        .iter()
        .filter_map(|site| website_base_domain(site))
        .collect();

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for raw in find_urls(text) {
        let Some(url) = Url::parse(raw).ok().and_then(normalize) else {
            continue;
        };
        if is_image(&url) {
            continue;
        }
        let normalized = url.as_str().trim_end_matches('/').to_string();
        if !seen.insert(normalized.clone()) {
            continue;
        }

        let kind = match url.host_str().map(base_domain) {
            Some(domain) if org_domains.contains(&domain) => CitationKind::Primary,
            _ => CitationKind::Secondary,
        };
        out.push(ExtractedCitation {
            url: normalized,
            kind,
        });
    }

    out
}

/// True when any extracted citation points at the org's own site.
pub fn has_primary_citation(text: &str, org_websites: &[String]) -> bool {
    extract_citations(text, org_websites)
        .iter()
        .any(|c| c.kind == CitationKind::Primary)
}

fn normalize(mut url: Url) -> Option<Url> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    if let Some(bare) = host.strip_prefix("www.") {
        url.set_host(Some(bare)).ok()?;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    url.set_fragment(None);
    Some(url)
}

fn is_image(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Registrable domain of a host, e.g. `blog.acme.co.uk` → `acme.co.uk`.
pub fn base_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }

    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if MULTI_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len() - keep..].join(".")
}

/// Org websites are stored with or without a scheme.
fn website_base_domain(site: &str) -> Option<String> {
    let site = site.trim();
    if site.is_empty() {
        return None;
    }
    let with_scheme = if site.contains("://") {
        site.to_string()
    } else {
        format!("https://{site}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    url.host_str().map(base_domain)
}
