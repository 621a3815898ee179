use serde::{Deserialize, Serialize};

/// A page as fetched from Confluence, ready to be written to disk.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: String,
    pub title: String,
    /// Titles of the parent pages, root first.
    pub ancestors: Vec<String>,
    /// Body in Confluence storage format.
    pub body_html: String,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub download_url: String,
    pub media_type: Option<String>,
    pub page_id: String,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "bmp"];

impl Attachment {
    pub fn is_image(&self) -> bool {
        if let Some(media_type) = self.media_type.as_deref() {
            return media_type.to_ascii_lowercase().starts_with("image/");
        }
        let extension = self
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        IMAGE_EXTENSIONS.contains(&extension.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageFrontMatter {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Space,
    Page,
    Attachment,
    File,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemKind::Space => "space",
            ItemKind::Page => "page",
            ItemKind::Attachment => "attachment",
            ItemKind::File => "file",
        };
        f.write_str(name)
    }
}

/// Something the run gave up on without aborting.
#[derive(Debug, Clone)]
pub struct SkippedItem {
    pub kind: ItemKind,
    pub name: String,
    pub reason: String,
}
