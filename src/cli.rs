use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "Export a Confluence instance to a Markdown directory tree")]
pub struct Cli {
    /// Base URL of the Confluence instance.
    pub url: String,

    /// Username (the account e-mail on Confluence Cloud).
    pub username: String,

    /// API token or password.
    pub token: String,

    /// Directory the exported tree is written to.
    pub out_dir: String,

    /// Only export the space with this key.
    #[arg(long)]
    pub space: Option<String>,

    /// Do not list or download attachments.
    #[arg(long)]
    pub skip_attachments: bool,

    /// Download only image attachments; link every other attachment to its remote URL.
    #[arg(long)]
    pub image_attachments_only: bool,

    /// Skip fetching and only convert HTML already present in the output directory.
    #[arg(long)]
    pub no_fetch: bool,

    /// Delete each HTML file after it was converted.
    #[arg(long)]
    pub remove_html: bool,

    /// Prepend YAML front matter (title, page id, last update) to every Markdown file.
    #[arg(long)]
    pub front_matter: bool,

    /// Parent page titles to leave out of the output paths.
    #[arg(long, num_args = 0.., value_name = "TITLE")]
    pub removable_parents: Vec<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn fetch_args(&self) -> FetchArgs {
        FetchArgs {
            url: self.url.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
            out: PathBuf::from(&self.out_dir),
            space: self.space.clone(),
            skip_attachments: self.skip_attachments,
            image_attachments_only: self.image_attachments_only,
            removable_parents: self.removable_parents.clone(),
        }
    }

    pub fn convert_args(&self) -> ConvertArgs {
        ConvertArgs {
            out: PathBuf::from(&self.out_dir),
            remove_html: self.remove_html,
            front_matter: self.front_matter,
        }
    }
}

// Keeps the token out of `?cli` debug logging.
impl std::fmt::Debug for Cli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cli")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("out_dir", &self.out_dir)
            .field("space", &self.space)
            .field("skip_attachments", &self.skip_attachments)
            .field("image_attachments_only", &self.image_attachments_only)
            .field("no_fetch", &self.no_fetch)
            .field("remove_html", &self.remove_html)
            .field("front_matter", &self.front_matter)
            .field("removable_parents", &self.removable_parents)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct FetchArgs {
    pub url: String,
    pub username: String,
    pub token: String,
    pub out: PathBuf,
    pub space: Option<String>,
    pub skip_attachments: bool,
    pub image_attachments_only: bool,
    pub removable_parents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConvertArgs {
    pub out: PathBuf,
    pub remove_html: bool,
    pub front_matter: bool,
}
