//! Reads exported page documents and rewrites Confluence storage markup into
//! plain HTML that `html2md` understands.

use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::Context as _;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::paths::{ATTACHMENTS_DIR_NAME, sanitize_segment};

const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".avi", ".mkv", ".mov", ".flv", ".wmv", ".m4v", ".webm",
];

/// Characters that would break a Markdown link target.
const LINK_TARGET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'(')
    .add(b')')
    .add(b'<')
    .add(b'>')
    .add(b'?');

#[derive(Debug, Default)]
pub struct RewrittenBody {
    pub html: String,
    /// Video URLs, indexed by the placeholder left in `html`.
    pub videos: Vec<String>,
}

/// An exported page: `<title>`, named `<meta>` values and the rewritten body.
#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub title: Option<String>,
    meta: HashMap<String, String>,
    pub body: RewrittenBody,
}

impl ParsedDocument {
    /// Passes markup through untouched, for documents that are not well-formed.
    pub fn unparsed(html: &str) -> Self {
        Self {
            body: RewrittenBody {
                html: html.to_owned(),
                videos: Vec::new(),
            },
            ..Self::default()
        }
    }

    pub fn meta(&self, name: &str) -> Option<&str> {
        self.meta
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn parse_document(html: &str) -> anyhow::Result<ParsedDocument> {
    let mut rewriter = Rewriter::new(html);
    rewriter.run().context("parse storage markup")?;
    Ok(rewriter.doc)
}

pub fn rewrite_storage_markup(body: &str) -> anyhow::Result<RewrittenBody> {
    Ok(parse_document(body)?.body)
}

struct Rewriter<'a> {
    reader: Reader<&'a [u8]>,
    doc: ParsedDocument,
}

impl<'a> Rewriter<'a> {
    fn new(html: &'a str) -> Self {
        let mut reader = Reader::from_str(html);
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        Self {
            reader,
            doc: ParsedDocument::default(),
        }
    }

    fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.reader.read_event()? {
                Event::Start(tag) => self.start(&tag)?,
                Event::Empty(tag) => self.empty(&tag),
                Event::End(tag) => {
                    let name = lowercase_name(tag.name().as_ref());
                    self.end(&name);
                }
                Event::Text(text) => self.push(&String::from_utf8_lossy(&text)),
                Event::GeneralRef(entity) => {
                    self.push(&format!("&{};", String::from_utf8_lossy(&entity)));
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data);
                    self.push(&escape(&*text));
                }
                Event::Eof => return Ok(()),
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            }
        }
    }

    fn start(&mut self, tag: &BytesStart<'a>) -> anyhow::Result<()> {
        let name = tag_name(tag);
        match name.as_str() {
            "html" | "head" | "body" => {}
            "title" => {
                let title = collect_text(&self.read_children()?);
                let title = title.trim();
                if !title.is_empty() {
                    self.doc.title = Some(title.to_owned());
                }
            }
            "meta" => self.record_meta(tag),
            "script" | "style" => {
                self.read_children()?;
            }
            "a" => match attribute(tag, "href").filter(|href| is_video_url(href)) {
                Some(href) => {
                    self.read_children()?;
                    self.push_video(href);
                }
                None => self.push(&format!("<{}>", String::from_utf8_lossy(tag))),
            },
            "ac:image" => {
                let children = self.read_children()?;
                self.push_image(&children);
            }
            "ac:link" => {
                let children = self.read_children()?;
                self.push_link(tag, &children);
            }
            "ac:plain-text-body" => {
                let code = collect_text(&self.read_children()?);
                self.push(&format!("<pre><code>{}</code></pre>", escape(code.as_str())));
            }
            "ac:task-status" => {
                let status = collect_text(&self.read_children()?);
                if status.trim().eq_ignore_ascii_case("complete") {
                    self.push("[x] ");
                } else {
                    self.push("[ ] ");
                }
            }
            "ac:task-list" => self.push("<ul>"),
            "ac:task" => self.push("<li>"),
            "ac:parameter" | "ac:placeholder" | "ac:task-id" => {
                self.read_children()?;
            }
            other if is_storage_tag(other) => {}
            _ => self.push(&format!("<{}>", String::from_utf8_lossy(tag))),
        }
        Ok(())
    }

    fn empty(&mut self, tag: &BytesStart<'a>) {
        let name = tag_name(tag);
        match name.as_str() {
            "meta" => self.record_meta(tag),
            "ac:link" => self.push_link(tag, &[]),
            "html" | "head" | "body" | "title" | "script" | "style" => {}
            other if is_storage_tag(other) => {}
            _ => self.push(&format!("<{}/>", String::from_utf8_lossy(tag))),
        }
    }

    fn end(&mut self, name: &str) {
        match name {
            "html" | "head" | "body" | "title" | "meta" => {}
            "ac:task-list" => self.push("</ul>"),
            "ac:task" => self.push("</li>"),
            other if is_storage_tag(other) => {}
            _ => self.push(&format!("</{name}>")),
        }
    }

    /// Consumes events up to the end tag matching the element just opened.
    fn read_children(&mut self) -> anyhow::Result<Vec<Event<'a>>> {
        let mut events = Vec::new();
        let mut depth = 0_usize;
        loop {
            let event = self.reader.read_event()?;
            match &event {
                Event::Start(tag) if !is_void(tag) => depth += 1,
                Event::End(_) if depth == 0 => break,
                Event::End(_) => depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            events.push(event);
        }
        Ok(events)
    }

    fn push(&mut self, html: &str) {
        self.doc.body.html.push_str(html);
    }

    fn push_video(&mut self, href: String) {
        let marker = video_placeholder(self.doc.body.videos.len());
        self.doc.body.videos.push(href);
        self.push(&marker);
    }

    fn record_meta(&mut self, tag: &BytesStart<'_>) {
        if let (Some(name), Some(content)) = (attribute(tag, "name"), attribute(tag, "content")) {
            self.doc.meta.insert(name.to_ascii_lowercase(), content);
        }
    }

    fn push_image(&mut self, children: &[Event<'a>]) {
        for event in children {
            let (Event::Start(tag) | Event::Empty(tag)) = event else {
                continue;
            };
            let (src, alt) = match tag_name(tag).as_str() {
                "ri:attachment" => match attribute(tag, "ri:filename") {
                    Some(filename) => (attachment_href(&filename), filename),
                    None => continue,
                },
                "ri:url" => match attribute(tag, "ri:value") {
                    Some(url) => (url.clone(), url),
                    None => continue,
                },
                _ => continue,
            };
            self.push(&format!(
                "<img src=\"{}\" alt=\"{}\"><br>",
                escape(src.as_str()),
                escape(alt.as_str())
            ));
            return;
        }
    }

    fn push_link(&mut self, tag: &BytesStart<'_>, children: &[Event<'a>]) {
        let mut filename = attribute(tag, "ri:filename");
        let mut page_title = None;
        let mut url = None;
        let mut label = None;

        let mut idx = 0;
        while idx < children.len() {
            let (child, is_start) = match &children[idx] {
                Event::Start(child) => (child, true),
                Event::Empty(child) => (child, false),
                _ => {
                    idx += 1;
                    continue;
                }
            };
            match tag_name(child).as_str() {
                "ri:attachment" => {
                    if let Some(name) = attribute(child, "ri:filename") {
                        filename = Some(name);
                    }
                }
                "ri:page" => page_title = attribute(child, "ri:content-title"),
                "ri:url" => url = attribute(child, "ri:value"),
                "ac:plain-text-link-body" if is_start => {
                    let (content, next) = element_content(children, idx);
                    label = Some(escape(collect_text(content).as_str()).into_owned());
                    idx = next;
                    continue;
                }
                "ac:link-body" if is_start => {
                    let (content, next) = element_content(children, idx);
                    label = Some(render_events(content));
                    idx = next;
                    continue;
                }
                _ => {}
            }
            idx += 1;
        }
        let label = label.filter(|label| !label.trim().is_empty());

        let target = filename
            .map(|filename| (attachment_href(&filename), filename))
            .or_else(|| url.map(|url| (url.clone(), url)));
        if let Some((href, text)) = target {
            if is_video_url(&href) {
                self.push_video(href);
                return;
            }
            let label = label.unwrap_or_else(|| escape(text.as_str()).into_owned());
            self.push(&format!("<a href=\"{}\">{label}</a>", escape(href.as_str())));
            return;
        }

        if let Some(label) = label {
            self.push(&label);
        } else if let Some(title) = page_title {
            self.push(&escape(title.as_str()));
        }
    }
}

/// Events between the start tag at `open` and its end tag, plus the index after it.
fn element_content<'e, 'a>(events: &'e [Event<'a>], open: usize) -> (&'e [Event<'a>], usize) {
    let mut depth = 0_usize;
    for (idx, event) in events.iter().enumerate().skip(open + 1) {
        match event {
            Event::Start(tag) if !is_void(tag) => depth += 1,
            Event::End(_) if depth == 0 => return (&events[open + 1..idx], idx + 1),
            Event::End(_) => depth -= 1,
            _ => {}
        }
    }
    (&events[open + 1..], events.len())
}

fn collect_text(events: &[Event<'_>]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            Event::Text(raw) => text.push_str(&String::from_utf8_lossy(raw)),
            Event::CData(raw) => text.push_str(&String::from_utf8_lossy(raw)),
            Event::GeneralRef(entity) => {
                text.push_str(&resolve_entity(&String::from_utf8_lossy(entity)));
            }
            _ => {}
        }
    }
    text
}

/// Serializes plain HTML events back to markup, dropping storage tags.
fn render_events(events: &[Event<'_>]) -> String {
    let mut html = String::new();
    for event in events {
        match event {
            Event::Start(tag) if !is_storage_tag(&tag_name(tag)) => {
                html.push_str(&format!("<{}>", String::from_utf8_lossy(tag)));
            }
            Event::Empty(tag) if !is_storage_tag(&tag_name(tag)) => {
                html.push_str(&format!("<{}/>", String::from_utf8_lossy(tag)));
            }
            Event::End(tag) => {
                let name = lowercase_name(tag.name().as_ref());
                if !is_storage_tag(&name) {
                    html.push_str(&format!("</{name}>"));
                }
            }
            Event::Text(text) => html.push_str(&String::from_utf8_lossy(text)),
            Event::GeneralRef(entity) => {
                html.push_str(&format!("&{};", String::from_utf8_lossy(entity)));
            }
            Event::CData(data) => html.push_str(&escape(&*String::from_utf8_lossy(data))),
            _ => {}
        }
    }
    html
}

fn resolve_entity(name: &str) -> String {
    if name == "nbsp" {
        return "\u{a0}".to_owned();
    }
    let reference = format!("&{name};");
    unescape(&reference).map_or_else(|_| reference.clone(), Cow::into_owned)
}

fn tag_name(tag: &BytesStart<'_>) -> String {
    lowercase_name(tag.name().as_ref())
}

fn lowercase_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

/// HTML elements that never have an end tag, such as `<br>` or `<img>`.
fn is_void(tag: &BytesStart<'_>) -> bool {
    matches!(
        tag_name(tag).as_str(),
        "area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta"
            | "source" | "track" | "wbr"
    )
}

fn is_storage_tag(name: &str) -> bool {
    name.starts_with("ac:") || name.starts_with("ri:")
}

fn attribute(tag: &BytesStart<'_>, name: &str) -> Option<String> {
    tag.html_attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name.as_bytes())
        .map(|attr| {
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            unescape(&raw).map_or_else(|_| raw.clone(), Cow::into_owned)
        })
}

fn attachment_href(filename: &str) -> String {
    let name = sanitize_segment(filename);
    format!(
        "{ATTACHMENTS_DIR_NAME}/{}",
        utf8_percent_encode(&name, LINK_TARGET)
    )
}

fn is_video_url(href: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    let path = path.to_ascii_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn video_placeholder(idx: usize) -> String {
    format!("%%VIDEO{idx}%%")
}

/// Replaces each placeholder with a `![type:video](url)` line of its own. Inside
/// a list item the line is indented so that it stays part of the item.
pub fn restore_video_markers(markdown: &str, videos: &[String]) -> String {
    let mut out = markdown.to_owned();
    for (idx, url) in videos.iter().enumerate() {
        let placeholder = video_placeholder(idx);
        let Some(pos) = out.find(&placeholder) else {
            tracing::debug!(%url, "video placeholder lost during conversion");
            continue;
        };
        let line_start = out[..pos].rfind('\n').map_or(0, |i| i + 1);
        let line_end = out[pos..].find('\n').map_or(out.len(), |i| pos + i);

        let line = &out[line_start..line_end];
        let at = pos - line_start;
        let lead = list_item_lead(line).min(at);
        let indent = " ".repeat(lead);
        let marker = format!("![type:video]({url})");

        let before = line[lead..at].trim();
        let after = line[at + placeholder.len()..].trim();
        let mut rebuilt = line[..lead].to_owned();
        if before.is_empty() {
            rebuilt.push_str(&marker);
        } else {
            rebuilt.push_str(&format!("{before}\n\n{indent}{marker}"));
        }
        if !after.is_empty() {
            rebuilt.push_str(&format!("\n\n{indent}{after}"));
        }

        out.replace_range(line_start..line_end, &rebuilt);
    }
    out
}

/// Width of the indentation plus list marker (`* `, `- `, `+ `, `1. `) that
/// starts `line`.
fn list_item_lead(line: &str) -> usize {
    let indent = line.len() - line.trim_start_matches(' ').len();
    let rest = &line[indent..];
    if rest.starts_with("* ") || rest.starts_with("- ") || rest.starts_with("+ ") {
        return indent + 2;
    }
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && rest[digits..].starts_with(". ") {
        return indent + digits + 2;
    }
    indent
}
