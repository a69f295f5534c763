//! A `Fetcher` with canned responses, for tests and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::fetch::{FetchError, FetchRequest, FetchedPage, Fetcher, Method};

#[derive(Debug, Clone)]
enum Scripted {
    Page { status: u16, content_type: Option<String>, headers: Vec<(String, String)>, body: Vec<u8> },
    Fail(FetchError),
}

/// Responses keyed by canonical URL. Unscripted URLs answer 404 with an
/// empty body; every request is recorded.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: HashMap<String, Scripted>,
    log: Mutex<Vec<FetchRequest>>,
}

fn key(url: &str) -> String {
    target_policy::canonical_str(url).unwrap_or_else(|| url.to_string())
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, status: u16, content_type: &str, headers: &[(&str, &str)], body: &str) -> Self {
        self.responses.insert(
            key(url),
            Scripted::Page {
                status,
                content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
                headers: headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.to_string())).collect(),
                body: body.as_bytes().to_vec(),
            },
        );
        self
    }

    pub fn html(self, url: &str, body: &str) -> Self {
        self.page(url, 200, "text/html; charset=utf-8", &[], body)
    }

    pub fn fail(mut self, url: &str, error: FetchError) -> Self {
        self.responses.insert(key(url), Scripted::Fail(error));
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url.to_string()).collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn send(&self, req: FetchRequest) -> Result<FetchedPage, FetchError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(req.clone());
        }
        let url: Url = req.url.clone();
        match self.responses.get(&key(url.as_str())) {
            Some(Scripted::Fail(e)) => Err(e.clone()),
            Some(Scripted::Page { status, content_type, headers, body }) => {
                let mut headers = headers.clone();
                if let Some(ct) = content_type {
                    if !headers.iter().any(|(k, _)| k == "content-type") {
                        headers.push(("content-type".into(), ct.clone()));
                    }
                }
                Ok(FetchedPage {
                    url,
                    status: *status,
                    content_type: content_type.clone(),
                    headers,
                    body: if req.method == Method::Head { Vec::new() } else { body.clone() },
                    truncated: false,
                })
            }
            None => Ok(FetchedPage { url, status: 404, content_type: None, headers: Vec::new(), body: Vec::new(), truncated: false }),
        }
    }
}
