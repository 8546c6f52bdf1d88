use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::util::validate_url;

/// Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack abuse from maliciously crafted deeply nested documents.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// OPML nesting depth exceeds the safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed subscription extracted from an OPML file.
#[derive(Debug, Clone)]
pub struct OpmlFeed {
    /// Display title. Sourced from `title`, falling back to `text`, then to
    /// the XML URL itself.
    pub title: String,
    /// URL of the feed document. Validated to be HTTP(S) and not pointing at
    /// localhost or private ranges.
    pub xml_url: String,
    /// URL of the feed's website, if provided via `htmlUrl`.
    pub html_url: Option<String>,
    /// Grouping key taken from the innermost enclosing non-feed outline.
    pub category: Option<String>,
}

/// Parses an OPML file from disk and extracts feed subscriptions.
///
/// Feeds with invalid URLs (localhost, private IPs, non-HTTP schemes) are
/// skipped with a warning log. Category/folder outlines contribute the
/// `category` of the feeds nested inside them.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the content is not valid
/// XML, or the outline nesting exceeds the depth limit.
pub async fn parse(path: &str) -> Result<Vec<OpmlFeed>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

/// Parses OPML content and extracts feed subscriptions.
///
/// Handles both nested and flat structures, extracting feeds from any
/// `<outline>` element with an `xmlUrl` attribute regardless of depth.
pub fn parse_opml_content(content: &str) -> Result<Vec<OpmlFeed>> {
    // XXE posture: quick-xml (0.37) never parses <!ENTITY> declarations from
    // DOCTYPE; only the five XML builtins resolve. Custom entities produce an
    // UnrecognizedEntity error via decode_and_unescape_value().
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // Enclosing non-feed outlines; the innermost is the category key.
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if folders.len() + 1 > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }

                let outline = parse_outline_attributes(&e, &reader)?;
                match outline {
                    Outline::Feed(mut feed) => {
                        feed.category = current_category(&folders);
                        feeds.push(feed);
                        // A feed outline that nests children still occupies a
                        // depth level, but contributes no category.
                        folders.push(None);
                    }
                    Outline::Folder(name) => folders.push(Some(name)),
                    Outline::Skipped => folders.push(None),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Outline::Feed(mut feed) = parse_outline_attributes(&e, &reader)? {
                    feed.category = current_category(&folders);
                    feeds.push(feed);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

fn current_category(folders: &[Option<String>]) -> Option<String> {
    folders.iter().rev().find_map(|f| f.clone())
}

enum Outline {
    Feed(OpmlFeed),
    Folder(String),
    Skipped,
}

/// Classifies one outline element: a feed (has a valid `xmlUrl`), a folder
/// (no `xmlUrl` but a name), or skipped (invalid URL or nameless).
fn parse_outline_attributes(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Outline> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"htmlUrl" => {
                let url_str = attr.decode_and_unescape_value(decoder)?;
                match validate_url(&url_str) {
                    Ok(_) => html_url = Some(url_str.to_string()),
                    Err(e) => {
                        tracing::warn!(url = %url_str, error = %e, "Ignoring invalid htmlUrl in OPML");
                    }
                }
            }
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => {
                if title.is_none() {
                    title = Some(attr.decode_and_unescape_value(decoder)?.to_string())
                }
            }
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(match title {
            Some(name) if !name.trim().is_empty() => Outline::Folder(name),
            _ => Outline::Skipped,
        });
    };

    match validate_url(&url) {
        Ok(_) => Ok(Outline::Feed(OpmlFeed {
            title: title.unwrap_or_else(|| url.clone()),
            xml_url: url,
            html_url,
            category: None,
        })),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            Ok(Outline::Skipped)
        }
    }
}

/// Exports feed subscriptions as an OPML 2.0 XML string.
///
/// Uncategorized feeds come first at body level, then one wrapping outline
/// per category containing its feeds. Categories appear in first-seen order.
pub fn export_opml(feeds: &[OpmlFeed]) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("estuary subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    // Uncategorized feeds first, at body level.
    for feed in feeds.iter().filter(|f| f.category.is_none()) {
        write_feed_outline(&mut writer, feed)?;
    }

    // Then one wrapping outline per category, in first-seen order.
    let mut categories: Vec<&str> = Vec::new();
    for feed in feeds {
        if let Some(category) = feed.category.as_deref() {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
    }

    for category in categories {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("text", category));
        outline.push_attribute(("title", category));
        writer
            .write_event(Event::Start(outline))
            .context("Failed to write category outline")?;

        for feed in feeds
            .iter()
            .filter(|f| f.category.as_deref() == Some(category))
        {
            write_feed_outline(&mut writer, feed)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to write category outline end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_feed_outline<W: std::io::Write>(
    writer: &mut quick_xml::Writer<W>,
    feed: &OpmlFeed,
) -> Result<()> {
    use quick_xml::events::{BytesStart, Event};

    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.xml_url.as_str()));
    if let Some(ref html_url) = feed.html_url {
        outline.push_attribute(("htmlUrl", html_url.as_str()));
    }
    writer
        .write_event(Event::Empty(outline))
        .context("Failed to write outline element")?;
    Ok(())
}

/// Exports feed subscriptions to an OPML file atomically
/// (write-to-temp-then-rename).
pub fn export_to_file(feeds: &[OpmlFeed], path: &std::path::Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(feeds)?;

    // Randomized temp filename so a concurrent export cannot collide.
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temporary file '{}'", temp_path.display()))?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to write OPML to '{}'", temp_path.display())
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!("Failed to sync '{}' to disk", temp_path.display())
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_outlines_with_categories() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline type="rss" text="Loose Feed" xmlUrl="https://loose.example.com/rss"/>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com"/>
      <outline type="rss" text="No HTML" title="No HTML" xmlUrl="https://nohtml.com/rss"/>
    </outline>
  </body>
</opml>"#;

        let feeds = parse_opml_content(content).expect("Failed to parse nested OPML");
        assert_eq!(feeds.len(), 3);

        assert_eq!(feeds[0].title, "Loose Feed");
        assert_eq!(feeds[0].category, None);

        assert_eq!(feeds[1].title, "Example Blog");
        assert_eq!(feeds[1].xml_url, "https://example.com/feed.xml");
        assert_eq!(feeds[1].html_url, Some("https://example.com".to_string()));
        assert_eq!(feeds[1].category.as_deref(), Some("Blogs"));

        assert_eq!(feeds[2].category.as_deref(), Some("Blogs"));
    }

    #[test]
    fn innermost_folder_wins() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
  <outline text="Outer">
    <outline text="Inner">
      <outline type="rss" xmlUrl="https://deep.example.com/feed"/>
    </outline>
  </outline>
</body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].category.as_deref(), Some("Inner"));
    }

    #[test]
    fn title_falls_back_to_text_then_url() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
    <outline type="rss" text="Text Only" xmlUrl="https://textonly.com/feed"/>
    <outline type="rss" xmlUrl="https://notitle.com/feed"/>
</body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds[0].title, "Text Only");
        assert_eq!(feeds[1].title, "https://notitle.com/feed");
    }

    #[test]
    fn invalid_urls_are_skipped() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body>
        <outline xmlUrl="https://valid.com/feed"/>
        <outline xmlUrl="http://192.168.1.1/feed"/>
        <outline xmlUrl="http://localhost/feed"/>
        <outline xmlUrl="file:///etc/passwd"/>
    </body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].xml_url, "https://valid.com/feed");
    }

    #[test]
    fn empty_opml_yields_no_feeds() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body></body></opml>"#;
        assert!(parse_opml_content(content).unwrap().is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_opml_content("<not valid xml").is_err());
    }

    #[test]
    fn xxe_entities_do_not_expand() {
        let malicious = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0">
    <body>
        <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
    </body>
</opml>"#;

        match parse_opml_content(malicious) {
            Ok(feeds) => {
                for feed in &feeds {
                    assert!(!feed.title.contains("root:"), "XXE expansion detected");
                }
            }
            Err(_) => {
                // Rejecting the payload is also acceptable.
            }
        }
    }

    #[test]
    fn deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let result = parse_opml_content(&opml);
        assert!(result.is_err(), "Deeply nested OPML should be rejected");
    }

    #[test]
    fn export_groups_by_category_uncategorized_first() {
        let feeds = vec![
            OpmlFeed {
                title: "Categorized".to_string(),
                xml_url: "https://cat.example.com/rss".to_string(),
                html_url: None,
                category: Some("News".to_string()),
            },
            OpmlFeed {
                title: "Loose".to_string(),
                xml_url: "https://loose.example.com/rss".to_string(),
                html_url: None,
                category: None,
            },
        ];

        let exported = export_opml(&feeds).unwrap();
        let loose_pos = exported.find("Loose").unwrap();
        let category_pos = exported.find("<outline text=\"News\"").unwrap();
        assert!(loose_pos < category_pos, "uncategorized feeds come first");

        let parsed = parse_opml_content(&exported).unwrap();
        assert_eq!(parsed.len(), 2);
        let categorized = parsed.iter().find(|f| f.title == "Categorized").unwrap();
        assert_eq!(categorized.category.as_deref(), Some("News"));
    }

    #[test]
    fn export_escapes_xml_special_chars() {
        let feeds = vec![OpmlFeed {
            title: "Feed with <special> & \"chars\"".to_string(),
            xml_url: "https://example.com/feed?a=1&b=2".to_string(),
            html_url: None,
            category: None,
        }];

        let exported = export_opml(&feeds).unwrap();
        let parsed = parse_opml_content(&exported).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "Feed with <special> & \"chars\"");
        assert_eq!(parsed[0].xml_url, "https://example.com/feed?a=1&b=2");
    }

    #[test]
    fn export_to_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.opml");

        let feeds = vec![OpmlFeed {
            title: "File Export Test".to_string(),
            xml_url: "https://example.com/feed.xml".to_string(),
            html_url: Some("https://example.com".to_string()),
            category: None,
        }];

        export_to_file(&feeds, &path).expect("Failed to export to file");

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed = parse_opml_content(&content).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "File Export Test");
    }
}
