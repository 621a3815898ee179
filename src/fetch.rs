use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use quick_xml::escape::escape;

use crate::cli::FetchArgs;
use crate::confluence::{ConfluenceClient, Space};
use crate::formats::{Attachment, ItemKind, Page, SkippedItem};
use crate::paths::{self, RemovableParents};

pub const LAST_UPDATED_META: &str = "last-updated";
pub const PAGE_ID_META: &str = "confluence-page-id";
pub const EXPORTED_AT_META: &str = "exported-at";

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub spaces: usize,
    pub pages_written: usize,
    pub attachments_downloaded: usize,
    pub attachments_present: usize,
    pub attachments_linked: usize,
    pub skipped: Vec<SkippedItem>,
}

impl FetchSummary {
    fn skip(&mut self, kind: ItemKind, name: impl Into<String>, err: &anyhow::Error) {
        let item = SkippedItem {
            kind,
            name: name.into(),
            reason: format!("{err:#}"),
        };
        tracing::warn!(kind = %item.kind, name = %item.name, reason = %item.reason, "skipped");
        self.skipped.push(item);
    }
}

pub async fn run(args: FetchArgs) -> anyhow::Result<FetchSummary> {
    let client = ConfluenceClient::new(&args.url, &args.username, &args.token)
        .context("configure confluence client")?;
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("create output dir: {}", args.out.display()))?;

    let mut exporter = Exporter::new(&client, &args);
    exporter.dump().await?;

    let summary = exporter.summary;
    tracing::info!(
        spaces = summary.spaces,
        pages = summary.pages_written,
        attachments_downloaded = summary.attachments_downloaded,
        attachments_present = summary.attachments_present,
        attachments_linked = summary.attachments_linked,
        skipped = summary.skipped.len(),
        "fetch finished"
    );
    Ok(summary)
}

struct Exporter<'a> {
    client: &'a ConfluenceClient,
    args: &'a FetchArgs,
    removable: RemovableParents,
    seen: HashSet<String>,
    used_paths: HashSet<PathBuf>,
    summary: FetchSummary,
}

impl<'a> Exporter<'a> {
    fn new(client: &'a ConfluenceClient, args: &'a FetchArgs) -> Self {
        Self {
            client,
            args,
            removable: RemovableParents::new(&args.removable_parents),
            seen: HashSet::new(),
            used_paths: HashSet::new(),
            summary: FetchSummary::default(),
        }
    }

    async fn dump(&mut self) -> anyhow::Result<()> {
        tracing::info!(url = %self.client.base_url(), "listing spaces");
        let spaces = self.client.list_spaces().await?;
        if spaces.is_empty() {
            anyhow::bail!("no spaces found in Confluence; check the credentials");
        }

        let selected: Vec<Space> = match self.args.space.as_deref() {
            Some(key) => spaces.into_iter().filter(|space| space.key == key).collect(),
            None => spaces,
        };
        if selected.is_empty() {
            anyhow::bail!(
                "space not found: {}",
                self.args.space.as_deref().unwrap_or_default()
            );
        }

        for space in selected {
            self.dump_space(&space).await;
        }
        Ok(())
    }

    async fn dump_space(&mut self, space: &Space) {
        tracing::info!(
            space = %space.key,
            name = space.name.as_deref().unwrap_or_default(),
            "processing space"
        );
        let Some(homepage) = space.homepage.as_ref() else {
            let err = anyhow::anyhow!("space has no homepage");
            self.summary.skip(ItemKind::Space, space.key.clone(), &err);
            return;
        };
        self.summary.spaces += 1;

        // Depth-first, children in API order.
        let mut stack: Vec<(String, Vec<String>)> = vec![(homepage.id.clone(), Vec::new())];
        while let Some((page_id, ancestors)) = stack.pop() {
            let children = self.dump_page(&page_id, ancestors).await;
            stack.extend(children.into_iter().rev());
        }
    }

    /// Writes one page and returns the work items for its children.
    async fn dump_page(&mut self, page_id: &str, ancestors: Vec<String>) -> Vec<(String, Vec<String>)> {
        if !self.seen.insert(page_id.to_owned()) {
            let err = anyhow::anyhow!("page reached twice");
            self.summary.skip(ItemKind::Page, page_id, &err);
            return Vec::new();
        }

        let page = match self.client.get_page(page_id, ancestors).await {
            Ok(page) => page,
            Err(err) => {
                self.summary.skip(ItemKind::Page, page_id, &err);
                return Vec::new();
            }
        };

        let children = match self.client.list_child_pages(&page.id).await {
            Ok(children) => children,
            Err(err) => {
                self.summary
                    .skip(ItemKind::Page, format!("children of {}", page.title), &err);
                Vec::new()
            }
        };

        let page_path =
            paths::page_html_path(&self.args.out, &page, !children.is_empty(), &self.removable);
        let page_path = self.claim_path(page_path, &page);

        let attachments = if self.args.skip_attachments {
            Vec::new()
        } else {
            match self.client.list_attachments(&page.id).await {
                Ok(attachments) => attachments,
                Err(err) => {
                    self.summary
                        .skip(ItemKind::Attachment, format!("attachments of {}", page.title), &err);
                    Vec::new()
                }
            }
        };

        let (to_download, to_link): (Vec<Attachment>, Vec<Attachment>) = attachments
            .into_iter()
            .partition(|attachment| !self.args.image_attachments_only || attachment.is_image());

        match write_page_html(&page_path, &page, &to_link) {
            Ok(()) => {
                tracing::info!(
                    page = %page.title,
                    path = %display_relative(&self.args.out, &page_path),
                    "saved page"
                );
                self.summary.pages_written += 1;
                self.summary.attachments_linked += to_link.len();
            }
            Err(err) => {
                self.summary.skip(ItemKind::Page, page.title.clone(), &err);
            }
        }

        for attachment in &to_download {
            self.fetch_attachment(&page_path, attachment).await;
        }

        let mut child_ancestors = page.ancestors.clone();
        child_ancestors.push(page.title.clone());
        children
            .into_iter()
            .map(|child| (child.id, child_ancestors.clone()))
            .collect()
    }

    /// Keeps two pages of one run from sharing an output file.
    fn claim_path(&mut self, path: PathBuf, page: &Page) -> PathBuf {
        if self.used_paths.insert(path.clone()) {
            return path;
        }
        let renamed = paths::disambiguate(&path, &page.id);
        tracing::warn!(
            page = %page.title,
            path = %display_relative(&self.args.out, &path),
            renamed = %display_relative(&self.args.out, &renamed),
            "output path already used by another page; adding page id"
        );
        self.used_paths.insert(renamed.clone());
        renamed
    }

    async fn fetch_attachment(&mut self, page_path: &Path, attachment: &Attachment) {
        let dest = paths::attachment_path(page_path, &attachment.filename);
        if dest.is_file() {
            tracing::info!(path = %dest.display(), "attachment already exists; skipping download");
            self.summary.attachments_present += 1;
            return;
        }

        tracing::info!(attachment = %attachment.filename, path = %dest.display(), "downloading attachment");
        match self.client.download_to(&attachment.download_url, &dest).await {
            Ok(bytes) => {
                tracing::debug!(attachment = %attachment.filename, bytes, "downloaded attachment");
                self.summary.attachments_downloaded += 1;
            }
            Err(err) => {
                self.summary.skip(
                    ItemKind::Attachment,
                    format!("{} (page {})", attachment.filename, attachment.page_id),
                    &err,
                );
            }
        }
    }
}

fn write_page_html(path: &Path, page: &Page, linked: &[Attachment]) -> anyhow::Result<()> {
    let parent_dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("page path must have parent: {}", path.display()))?;
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("create page dir: {}", parent_dir.display()))?;

    let html = render_page_document(page, linked, &chrono::Utc::now().to_rfc3339());
    std::fs::write(path, html).with_context(|| format!("write page html: {}", path.display()))?;
    Ok(())
}

/// Wraps the storage body in a document whose head carries the metadata the
/// converter reads back.
pub fn render_page_document(page: &Page, linked: &[Attachment], exported_at: &str) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\" />\n");
    html.push_str(&format!("<title>{}</title>\n", escape(page.title.as_str())));
    html.push_str(&meta_tag(PAGE_ID_META, &page.id));
    if let Some(last_updated) = page.last_updated.as_deref() {
        html.push_str(&meta_tag(LAST_UPDATED_META, last_updated));
    }
    html.push_str(&meta_tag(EXPORTED_AT_META, exported_at));
    html.push_str("</head>\n<body>\n");
    html.push_str(&page.body_html);
    html.push('\n');
    for attachment in linked {
        html.push_str(&format!(
            "<p><a href=\"{}\">{}</a></p>\n",
            escape(attachment.download_url.as_str()),
            escape(attachment.filename.as_str())
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}

fn meta_tag(name: &str, content: &str) -> String {
    format!("<meta name=\"{name}\" content=\"{}\" />\n", escape(content))
}

fn display_relative(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" / ")
}
