#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct StubSpace {
    pub key: String,
    pub name: String,
    pub homepage_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StubAttachment {
    pub title: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StubPage {
    pub id: String,
    pub title: String,
    pub body: String,
    pub when: String,
    pub children: Vec<String>,
    pub attachments: Vec<StubAttachment>,
}

impl StubPage {
    pub fn new(id: &str, title: &str, body: &str) -> Self {
        Self {
            id: id.to_owned(),
            title: title.to_owned(),
            body: body.to_owned(),
            when: "2024-05-01T10:00:00.000Z".to_owned(),
            children: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: &[&str]) -> Self {
        self.children = children.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    pub fn with_attachment(mut self, title: &str, media_type: &str, bytes: &[u8]) -> Self {
        self.attachments.push(StubAttachment {
            title: title.to_owned(),
            media_type: media_type.to_owned(),
            bytes: bytes.to_vec(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubConfig {
    pub spaces: Vec<StubSpace>,
    pub pages: Vec<StubPage>,
    pub failing_pages: HashSet<String>,
    /// Attachment titles whose download answers 500.
    pub failing_downloads: HashSet<String>,
    pub reject_credentials: bool,
}

pub struct ConfluenceStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ConfluenceStub {
    pub fn spawn(config: StubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start confluence stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_log = Arc::clone(&requests);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let pages: HashMap<String, StubPage> = config
            .pages
            .iter()
            .map(|page| (page.id.clone(), page.clone()))
            .collect();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let path = url.split('?').next().unwrap_or(&url).to_owned();
                requests_log
                    .lock()
                    .expect("lock request log")
                    .push(path.clone());

                let has_basic_auth = request.headers().iter().any(|header| {
                    header.field.equiv("Authorization") && header.value.as_str().starts_with("Basic ")
                });
                if config.reject_credentials || !has_basic_auth {
                    let _ = request.respond(
                        tiny_http::Response::from_string(r#"{"message":"Unauthorized"}"#)
                            .with_status_code(401),
                    );
                    continue;
                }

                let response = route(&config, &pages, &path);
                let _ = match response {
                    Routed::Json(status, value) => {
                        let header = tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"application/json"[..],
                        )
                        .expect("build header");
                        request.respond(
                            tiny_http::Response::from_string(value.to_string())
                                .with_status_code(status)
                                .with_header(header),
                        )
                    }
                    Routed::Bytes(bytes) => {
                        request.respond(tiny_http::Response::from_data(bytes))
                    }
                    Routed::Status(status) => request.respond(
                        tiny_http::Response::from_string("stub error").with_status_code(status),
                    ),
                };
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock request log").clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|path| path.starts_with(prefix))
            .count()
    }
}

impl Drop for ConfluenceStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Routed {
    Json(u16, Value),
    Bytes(Vec<u8>),
    Status(u16),
}

fn route(config: &StubConfig, pages: &HashMap<String, StubPage>, path: &str) -> Routed {
    if path == "/rest/api/space" {
        let results: Vec<Value> = config
            .spaces
            .iter()
            .map(|space| {
                let mut value = json!({ "key": space.key, "name": space.name });
                if let Some(homepage_id) = &space.homepage_id {
                    let title = pages
                        .get(homepage_id)
                        .map(|page| page.title.clone())
                        .unwrap_or_default();
                    value["homepage"] = json!({ "id": homepage_id, "title": title });
                }
                value
            })
            .collect();
        let size = results.len();
        return Routed::Json(200, json!({ "results": results, "size": size, "_links": {} }));
    }

    if let Some(rest) = path.strip_prefix("/download/attachments/") {
        let mut parts = rest.splitn(2, '/');
        let page_id = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default().replace("%20", " ");
        if config.failing_downloads.contains(&name) {
            return Routed::Status(500);
        }
        return match pages
            .get(page_id)
            .and_then(|page| page.attachments.iter().find(|a| a.title == name))
        {
            Some(attachment) => Routed::Bytes(attachment.bytes.clone()),
            None => Routed::Status(404),
        };
    }

    let Some(rest) = path.strip_prefix("/rest/api/content/") else {
        return Routed::Status(404);
    };
    let segments: Vec<&str> = rest.split('/').collect();
    let page_id = segments[0];
    let Some(page) = pages.get(page_id) else {
        return Routed::Status(404);
    };

    match segments.as_slice() {
        [_] => {
            if config.failing_pages.contains(page_id) {
                return Routed::Status(500);
            }
            Routed::Json(
                200,
                json!({
                    "id": page.id,
                    "type": "page",
                    "title": page.title,
                    "body": { "storage": { "value": page.body, "representation": "storage" } },
                    "version": { "number": 3, "when": page.when },
                }),
            )
        }
        [_, "child", "page"] => {
            let results: Vec<Value> = page
                .children
                .iter()
                .map(|child_id| {
                    let title = pages
                        .get(child_id)
                        .map(|child| child.title.clone())
                        .unwrap_or_default();
                    json!({ "id": child_id, "type": "page", "title": title })
                })
                .collect();
            Routed::Json(200, json!({ "results": results, "_links": {} }))
        }
        [_, "child", "attachment"] => {
            let results: Vec<Value> = page
                .attachments
                .iter()
                .map(|attachment| {
                    json!({
                        "id": format!("att-{}", attachment.title),
                        "title": attachment.title,
                        "metadata": { "mediaType": attachment.media_type },
                        "_links": {
                            "download": format!(
                                "/download/attachments/{}/{}?version=1&api=v2",
                                page.id,
                                attachment.title.replace(' ', "%20")
                            ),
                        },
                    })
                })
                .collect();
            Routed::Json(200, json!({ "results": results, "_links": {} }))
        }
        _ => Routed::Status(404),
    }
}
