use std::collections::HashSet;
use std::path::Path;

use scraper::{Html, Selector};
use url::Url;

use crate::archive::{is_archive_path, is_image_path};

const DEFAULT_MAX_LINKS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLink {
    pub url: String,
    pub kind: MediaKind,
}

/// Collects image and archive URLs from a page, resolved against `base_url`.
///
/// Sources are `<img src>`, lazy-load `data-src` attributes, and anchors whose
/// target names an image or archive file. Order of first appearance is kept.
pub fn extract_media_links(html: &str, base_url: Option<&str>) -> Vec<MediaLink> {
    extract_media_links_limited(html, base_url, DEFAULT_MAX_LINKS)
}

pub fn extract_media_links_limited(
    html: &str,
    base_url: Option<&str>,
    max_links: usize,
) -> Vec<MediaLink> {
    let document = Html::parse_document(html);
    let base = base_url.and_then(|b| Url::parse(b).ok());
    let Ok(selector) = Selector::parse("img, a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&selector) {
        if links.len() >= max_links {
            break;
        }
        let value = element.value();
        let candidate = if value.name().eq_ignore_ascii_case("img") {
            value
                .attr("data-src")
                .or_else(|| value.attr("src"))
                .and_then(|raw| resolve(base.as_ref(), raw))
                .map(|url| (url, MediaKind::Image))
        } else {
            value
                .attr("href")
                .and_then(|raw| resolve(base.as_ref(), raw))
                .and_then(|url| classify(&url).map(|kind| (url, kind)))
        };
        if let Some((url, kind)) = candidate {
            if seen.insert(url.clone()) {
                links.push(MediaLink { url, kind });
            }
        }
    }
    links
}

fn resolve(base: Option<&Url>, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("data:") || trimmed.starts_with("javascript:") {
        return None;
    }
    let url = match base {
        Some(base) => base.join(trimmed).ok()?,
        None => Url::parse(trimmed).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn classify(url: &str) -> Option<MediaKind> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?.to_string();
    let path = Path::new(&segment);
    if is_archive_path(path) {
        Some(MediaKind::Archive)
    } else if is_image_path(path) {
        Some(MediaKind::Image)
    } else {
        None
    }
}
