//! Maps page ancestor chains to locations in the export tree.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::formats::Page;

pub const ATTACHMENTS_DIR_NAME: &str = "attachments";
pub const INDEX_FILE_STEM: &str = "index";

/// Parent titles that are left out of output paths, compared in sanitized form.
#[derive(Debug, Clone, Default)]
pub struct RemovableParents {
    titles: HashSet<String>,
}

impl RemovableParents {
    pub fn new<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let titles = titles
            .into_iter()
            .map(|title| sanitize_segment(title.as_ref()))
            .filter(|title| !title.is_empty())
            .collect();
        Self { titles }
    }

    pub fn contains(&self, sanitized: &str) -> bool {
        self.titles.contains(sanitized)
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

/// Makes a page or attachment title usable as a single path segment.
///
/// Separators and `..` become `_`, characters rejected by common filesystems are
/// dropped, and surrounding whitespace and trailing dots are trimmed. When nothing
/// is left the title is returned unchanged, except that a name made only of dots
/// becomes `_`.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '/' | '\\' => out.push('_'),
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => {}
            ch if ch.is_control() => {}
            ch => out.push(ch),
        }
    }
    let out = out.replace("..", "_");
    let trimmed = out.trim().trim_end_matches('.').trim_end();

    let segment = if trimmed.is_empty() { raw } else { trimmed };
    let bare = segment.trim();
    if !bare.is_empty() && bare.chars().all(|ch| ch == '.') {
        tracing::debug!(title = raw, "dot-only title; using _");
        return "_".to_owned();
    }
    if segment != raw {
        tracing::debug!(title = raw, sanitized = %segment, "sanitized title");
    }
    segment.to_owned()
}

/// Directory segments for an ancestor chain: removable titles are dropped and
/// immediately repeated names collapse into one.
pub fn directory_segments(chain: &[String], removable: &RemovableParents) -> Vec<String> {
    let mut segments: Vec<String> = Vec::with_capacity(chain.len());
    for title in chain {
        let mut segment = sanitize_segment(title);
        if segment.trim().is_empty() || removable.contains(&segment) {
            continue;
        }
        // The converter never descends into attachment folders.
        if segment == ATTACHMENTS_DIR_NAME {
            segment = format!("_{segment}");
        }
        if segments.last() == Some(&segment) {
            continue;
        }
        segments.push(segment);
    }
    segments
}

/// Where the HTML export of `page` goes.
///
/// Pages with children become `<title>/index.html` so that the children share
/// their directory. When the page's own directory is filtered out or collapses
/// into its parent's, the page is written as `<title>.html` next to its children
/// instead. If every directory segment is filtered out the file lands directly in
/// `out_dir`.
pub fn page_html_path(
    out_dir: &Path,
    page: &Page,
    has_children: bool,
    removable: &RemovableParents,
) -> PathBuf {
    let parent_dirs = directory_segments(&page.ancestors, removable);
    let (dirs, stem) = if has_children {
        let mut chain = page.ancestors.clone();
        chain.push(page.title.clone());
        let own_dirs = directory_segments(&chain, removable);
        if own_dirs.len() > parent_dirs.len() {
            (own_dirs, INDEX_FILE_STEM.to_owned())
        } else {
            (parent_dirs, leaf_file_stem(page))
        }
    } else {
        (parent_dirs, leaf_file_stem(page))
    };

    let mut path = out_dir.to_path_buf();
    for segment in dirs {
        path.push(segment);
    }
    path.push(format!("{stem}.html"));
    path
}

fn leaf_file_stem(page: &Page) -> String {
    let stem = sanitize_segment(&page.title);
    if stem.trim().is_empty() {
        return sanitize_segment(&page.id);
    }
    // `index.html` belongs to the page that owns the directory.
    if stem.eq_ignore_ascii_case(INDEX_FILE_STEM) {
        return format!("{stem}-{}", sanitize_segment(&page.id));
    }
    stem
}

/// Same directory, file name suffixed with the page id. Used when two pages
/// would otherwise share one output path.
pub fn disambiguate(page_html_path: &Path, page_id: &str) -> PathBuf {
    let stem = page_html_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    page_html_path.with_file_name(format!("{stem}-{}.html", sanitize_segment(page_id)))
}

pub fn attachments_dir(page_html_path: &Path) -> PathBuf {
    match page_html_path.parent() {
        Some(parent) => parent.join(ATTACHMENTS_DIR_NAME),
        None => PathBuf::from(ATTACHMENTS_DIR_NAME),
    }
}

pub fn attachment_path(page_html_path: &Path, filename: &str) -> PathBuf {
    attachments_dir(page_html_path).join(sanitize_segment(filename))
}
