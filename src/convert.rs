use std::path::{Path, PathBuf};

use anyhow::Context as _;
use walkdir::WalkDir;

use crate::cli::ConvertArgs;
use crate::fetch::{LAST_UPDATED_META, PAGE_ID_META};
use crate::formats::{ItemKind, PageFrontMatter, SkippedItem};
use crate::paths::ATTACHMENTS_DIR_NAME;
use crate::storage::{self, ParsedDocument};

#[derive(Debug, Default)]
pub struct ConvertSummary {
    pub converted: usize,
    pub html_removed: usize,
    pub skipped: Vec<SkippedItem>,
}

pub fn run(args: ConvertArgs) -> anyhow::Result<ConvertSummary> {
    if !args.out.is_dir() {
        anyhow::bail!("output directory does not exist: {}", args.out.display());
    }

    let mut summary = ConvertSummary::default();
    for path in find_html_files(&args.out)? {
        tracing::info!(path = %path.display(), "converting");
        match convert_file(&path, &args) {
            Ok(md_path) => {
                summary.converted += 1;
                tracing::debug!(path = %md_path.display(), "wrote markdown");
                if args.remove_html {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            summary.html_removed += 1;
                            tracing::info!(path = %path.display(), "removed html file");
                        }
                        Err(err) => {
                            tracing::warn!(path = %path.display(), %err, "could not remove html file");
                        }
                    }
                }
            }
            Err(err) => {
                let item = SkippedItem {
                    kind: ItemKind::File,
                    name: path.display().to_string(),
                    reason: format!("{err:#}"),
                };
                tracing::warn!(kind = %item.kind, name = %item.name, reason = %item.reason, "skipped");
                summary.skipped.push(item);
            }
        }
    }

    tracing::info!(
        converted = summary.converted,
        html_removed = summary.html_removed,
        skipped = summary.skipped.len(),
        "convert finished"
    );
    Ok(summary)
}

fn convert_file(path: &Path, args: &ConvertArgs) -> anyhow::Result<PathBuf> {
    let html = std::fs::read_to_string(path)
        .with_context(|| format!("read html: {}", path.display()))?;
    let fallback_title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    let markdown = convert_document(&html, &fallback_title, args.front_matter)
        .with_context(|| format!("convert html: {}", path.display()))?;

    let md_path = path.with_extension("md");
    std::fs::write(&md_path, markdown)
        .with_context(|| format!("write markdown: {}", md_path.display()))?;
    Ok(md_path)
}

/// Recursively lists `*.html` files below `root` in sorted order. Symlinks and
/// attachment directories are not entered.
pub fn find_html_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir() && entry.file_name() == ATTACHMENTS_DIR_NAME)
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(err).with_context(|| format!("failed to walk {}", root.display()));
            }
            Err(err) => {
                tracing::warn!(%err, "cannot read directory entry; skipping");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) == Some("html") {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Converts one exported HTML document to Markdown.
pub fn convert_document(
    html: &str,
    fallback_title: &str,
    with_front_matter: bool,
) -> anyhow::Result<String> {
    let document = match storage::parse_document(html) {
        Ok(document) => document,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "markup is not well-formed; converting it as is");
            ParsedDocument::unparsed(html)
        }
    };

    let converted = html2md::parse_html(&document.body.html);
    let converted = storage::restore_video_markers(&converted, &document.body.videos);
    let converted = converted.trim();

    let mut markdown = String::new();
    if with_front_matter {
        let front_matter = PageFrontMatter {
            title: document
                .title
                .clone()
                .unwrap_or_else(|| fallback_title.to_owned()),
            page_id: document.meta(PAGE_ID_META).map(str::to_owned),
            last_updated: document.meta(LAST_UPDATED_META).map(str::to_owned),
        };
        let yaml = serde_yaml::to_string(&front_matter).context("serialize front matter")?;
        markdown.push_str(&format!("---\n{yaml}---\n\n"));
    }

    // html2md writes h1/h2 as setext headings, so also compare the first line.
    if let Some(title) = document.title.as_deref()
        && !converted.starts_with('#')
        && converted.lines().next().map(str::trim) != Some(title)
    {
        markdown.push_str(&format!("# {title}\n\n"));
    }
    if !converted.is_empty() {
        markdown.push_str(converted);
        markdown.push('\n');
    }

    if let Some(last_updated) = document.meta(LAST_UPDATED_META) {
        if !markdown.is_empty() {
            markdown.push('\n');
        }
        markdown.push_str(&format!("Last updated: {last_updated}\n"));
    }

    Ok(markdown)
}
