//! Thin async client for the Confluence REST API (`/rest/api`).

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::formats::{Attachment, Page};

const USER_AGENT_VALUE: &str = concat!("confluence-exporter/", env!("CARGO_PKG_VERSION"));
const PAGE_LIMIT: usize = 100;
const ERROR_BODY_LIMIT: usize = 512;
const CLOUD_HOST_SUFFIXES: &[&str] = &[".atlassian.net", ".jira.com"];

#[derive(Debug, Clone, Deserialize)]
pub struct Space {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub homepage: Option<ContentRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct Paged<T> {
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: PagedLinks,
}

#[derive(Debug, Default, Deserialize)]
struct PagedLinks {
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    #[serde(default)]
    body: Option<BodyResponse>,
    #[serde(default)]
    version: Option<VersionResponse>,
}

#[derive(Debug, Deserialize)]
struct BodyResponse {
    #[serde(default)]
    storage: Option<StorageResponse>,
}

#[derive(Debug, Deserialize)]
struct StorageResponse {
    value: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    title: String,
    #[serde(default)]
    metadata: Option<MediaTypeHolder>,
    #[serde(default)]
    extensions: Option<MediaTypeHolder>,
    #[serde(rename = "_links")]
    links: AttachmentLinks,
}

#[derive(Debug, Deserialize)]
struct MediaTypeHolder {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentLinks {
    download: String,
}

pub struct ConfluenceClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    token: String,
}

impl ConfluenceClient {
    pub fn new(url: &str, username: &str, token: &str) -> anyhow::Result<Self> {
        let base_url = normalize_base_url(url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build confluence http client")?;

        Ok(Self {
            http,
            base_url,
            username: username.to_owned(),
            token: token.to_owned(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/rest/api/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn list_spaces(&self) -> anyhow::Result<Vec<Space>> {
        let (spaces, _) = self
            .get_paged(
                "space",
                &[("expand", "description.plain,homepage".to_owned())],
            )
            .await
            .context("list spaces")?;
        Ok(spaces)
    }

    /// Fetches one page with its storage body. `ancestors` is carried through as given.
    pub async fn get_page(&self, page_id: &str, ancestors: Vec<String>) -> anyhow::Result<Page> {
        let url = self.api_url(&format!("content/{page_id}"));
        let content: ContentResponse = self
            .get_json(&url, &[("expand", "body.storage,version".to_owned())])
            .await?;

        Ok(Page {
            id: content.id,
            title: content.title,
            ancestors,
            body_html: content
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            last_updated: content.version.and_then(|version| version.when),
        })
    }

    pub async fn list_child_pages(&self, page_id: &str) -> anyhow::Result<Vec<ContentRef>> {
        let (children, _) = self
            .get_paged(&format!("content/{page_id}/child/page"), &[])
            .await
            .with_context(|| format!("list child pages of {page_id}"))?;
        Ok(children)
    }

    pub async fn list_attachments(&self, page_id: &str) -> anyhow::Result<Vec<Attachment>> {
        let (results, links_base) = self
            .get_paged::<AttachmentResponse>(&format!("content/{page_id}/child/attachment"), &[])
            .await
            .with_context(|| format!("list attachments of {page_id}"))?;

        let base = links_base.unwrap_or_else(|| self.base_url.to_string());
        let attachments = results
            .into_iter()
            .map(|attachment| Attachment {
                download_url: resolve_download_url(&base, &attachment.links.download),
                media_type: attachment
                    .metadata
                    .and_then(|m| m.media_type)
                    .or_else(|| attachment.extensions.and_then(|e| e.media_type)),
                filename: attachment.title,
                page_id: page_id.to_owned(),
            })
            .collect();
        Ok(attachments)
    }

    /// Streams `url` into `dest`. The body is written to a `.part` sibling first so an
    /// interrupted download never leaves a file that looks complete.
    pub async fn download_to(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        let mut response = self
            .authorized_get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(status_error(status, url, &raw));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create attachment dir: {}", parent.display()))?;
        }

        let partial = partial_path(dest);
        let result = async {
            let mut file = File::create(&partial)
                .with_context(|| format!("create attachment: {}", partial.display()))?;
            let mut written = 0_u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .with_context(|| format!("read attachment body: {url}"))?
            {
                file.write_all(&chunk)
                    .with_context(|| format!("write attachment: {}", partial.display()))?;
                written += chunk.len() as u64;
            }
            file.flush()
                .with_context(|| format!("flush attachment: {}", partial.display()))?;
            Ok::<_, anyhow::Error>(written)
        }
        .await;

        match result {
            Ok(written) => {
                std::fs::rename(&partial, dest)
                    .with_context(|| format!("move attachment into place: {}", dest.display()))?;
                Ok(written)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&partial);
                Err(err)
            }
        }
    }

    fn authorized_get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .basic_auth(&self.username, Some(&self.token))
            .header(USER_AGENT, USER_AGENT_VALUE)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let response = self
            .authorized_get(url)
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .with_context(|| format!("read response body: {url}"))?;
        if !status.is_success() {
            return Err(status_error(status, url, &raw));
        }

        serde_json::from_str(&raw).with_context(|| format!("parse response: {url}"))
    }

    /// Collects every result of a collection endpoint, following `_links.next`.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        extra_query: &[(&str, String)],
    ) -> anyhow::Result<(Vec<T>, Option<String>)> {
        let url = self.api_url(path);
        let mut results = Vec::new();
        let mut links_base = None;
        let mut start = 0_usize;

        loop {
            let mut query = extra_query.to_vec();
            query.push(("start", start.to_string()));
            query.push(("limit", PAGE_LIMIT.to_string()));

            let page: Paged<T> = self.get_json(&url, &query).await?;
            let count = page.results.len();
            if links_base.is_none() {
                links_base = page.links.base;
            }
            results.extend(page.results);

            if count == 0 || page.links.next.is_none() {
                break;
            }
            start += count;
            tracing::debug!(%url, start, "fetching next result page");
        }

        Ok((results, links_base))
    }
}

fn status_error(status: StatusCode, url: &str, raw: &str) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow::anyhow!(
            "Confluence rejected the credentials ({status}) for {url}; check username and token"
        );
    }
    let mut body = raw.trim().to_owned();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    anyhow::anyhow!("Confluence API error ({status}) for {url}: {body}")
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Validates the instance URL. Atlassian Cloud sites serve the API under `/wiki`,
/// which is added when missing.
pub fn normalize_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("parse confluence url: {raw}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("confluence url must be http/https: {url}");
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("confluence url must have host: {url}"))?
        .to_ascii_lowercase();

    url.set_query(None);
    url.set_fragment(None);

    let mut path = url.path().trim_end_matches('/').to_owned();
    let is_cloud = CLOUD_HOST_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix));
    if is_cloud && !path.split('/').any(|segment| segment == "wiki") {
        path.push_str("/wiki");
    }
    url.set_path(&path);

    Ok(url)
}

pub fn resolve_download_url(base: &str, download: &str) -> String {
    if download.starts_with("http://") || download.starts_with("https://") {
        return download.to_owned();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        download.trim_start_matches('/')
    )
}
