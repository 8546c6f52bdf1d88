//! Best-effort feed-URL discovery from an HTML page.
//!
//! When a feed source serves HTML instead of a feed document, the updater
//! asks this module for a candidate feed URL and retries against it (bounded
//! by the updater's hop budget). Discovery never fails: if nothing better is
//! found it falls back to `<base>/feed`.

/// Derives a candidate feed URL from an HTML page.
///
/// Strategy, in order:
/// 1. `<link rel="alternate">` tags with an RSS/Atom type attribute.
/// 2. Anchor tags whose href looks feed-shaped (`/feed`, `/rss`, `/atom`,
///    `.xml`).
/// 3. Fallback: `base_url` with `/feed` appended.
///
/// Always returns *some* URL. The caller is responsible for validating it and
/// for loop-guarding repeated discovery attempts.
pub fn discover_feed_url(base_url: &str, html_bytes: &[u8]) -> String {
    let html = String::from_utf8_lossy(html_bytes);

    if let Some(href) = find_feed_link_in_html(&html, base_url) {
        return href;
    }

    if let Some(href) = find_feed_anchor_in_html(&html, base_url) {
        return href;
    }

    format!("{}/feed", base_url.trim_end_matches('/'))
}

/// Scans HTML for `<link>` tags with `rel="alternate"` and RSS/Atom type
/// attributes.
///
/// Uses simple string scanning (no HTML parser dependency). Handles attribute
/// ordering variations and resolves relative URLs against the base URL.
fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    let html_lower = html.to_lowercase();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = remaining.find('>')?;
        let tag = &remaining[..=tag_end];

        if contains_attr(tag, "rel", "alternate") && is_feed_type(tag) {
            // Extract href from the original (non-lowered) HTML to preserve URL case
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(href) = extract_attr_value(original_tag, "href") {
                return Some(resolve_url(href, base_url));
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

/// Scans anchor tags for hrefs that look like feed endpoints.
fn find_feed_anchor_in_html(html: &str, base_url: &str) -> Option<String> {
    let html_lower = html.to_lowercase();
    let mut search_from = 0;

    while let Some(a_start) = html_lower[search_from..].find("<a") {
        let abs_start = search_from + a_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        let original_tag = &html[abs_start..abs_start + tag_end + 1];
        if let Some(href) = extract_attr_value(original_tag, "href") {
            if looks_like_feed_path(href) {
                return Some(resolve_url(href, base_url));
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

fn looks_like_feed_path(href: &str) -> bool {
    // Strip query/fragment before inspecting the path shape.
    let path = href
        .split(['?', '#'])
        .next()
        .unwrap_or(href)
        .trim_end_matches('/')
        .to_lowercase();

    path.ends_with(".xml")
        || path.ends_with("/feed")
        || path.ends_with("/rss")
        || path.ends_with("/atom")
        || path == "feed"
        || path == "rss"
        || path == "atom"
}

/// Checks if a lowercased tag contains an attribute with the given value.
fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

/// Checks if a lowercased `<link>` tag has an RSS or Atom feed type.
fn is_feed_type(tag: &str) -> bool {
    tag.contains("application/rss+xml") || tag.contains("application/atom+xml")
}

/// Extracts the value of an attribute from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_lowercase();
    let attr_prefix = format!("{attr_name}=");

    let attr_start = tag_lower.find(&attr_prefix)?;
    let value_start = attr_start + attr_prefix.len();

    if value_start >= tag.len() {
        return None;
    }

    let rest = &tag[value_start..];
    let quote = rest.as_bytes().first()?;

    if *quote != b'"' && *quote != b'\'' {
        return None;
    }

    let quote_char = *quote as char;
    let inner = &rest[1..];
    let end = inner.find(quote_char)?;

    Some(&inner[..end])
}

/// Resolves a potentially relative URL against a base URL.
fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }

    // Protocol-relative — normalize through the URL parser.
    if href.starts_with("//") {
        let with_scheme = format!("https:{}", href);
        if let Ok(parsed) = url::Url::parse(&with_scheme) {
            return parsed.to_string();
        }
    }

    if let Ok(base) = url::Url::parse(base_url) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }

    href.to_owned()
}
