use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};

use crate::platform::{HttpClient, HttpRequest, HttpResponse};

const AUTO_REDIRECT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.into().into_bytes(),
        }
    }

    pub fn binary(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/octet-stream".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
            body,
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            headers: vec![("Location".into(), location.into())],
            body: Vec::new(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub follow_redirects: bool,
}

#[derive(Default)]
struct Script {
    routes: HashMap<String, CannedResponse>,
    requests: Vec<RecordedRequest>,
}

/// HTTP client answering from a fixed URL table and logging every request
#[derive(Clone, Default)]
pub struct ScriptedHttp {
    script: Arc<Mutex<Script>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn route(&self, url: &str, response: CannedResponse) -> &Self {
        self.script().routes.insert(url.to_string(), response);
        self
    }

    pub fn unroute(&self, url: &str) {
        self.script().routes.remove(url);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.script()
            .requests
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    pub fn clear_requests(&self) {
        self.script().requests.clear();
    }
}

impl HttpClient for ScriptedHttp {
    fn get(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let mut script = self.script();
        let mut url = request.url.to_string();
        let mut hops = 0;

        loop {
            script.requests.push(RecordedRequest {
                url: url.clone(),
                headers: request
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                follow_redirects: request.follow_redirects,
            });

            let canned = script
                .routes
                .get(&url)
                .cloned()
                .ok_or_else(|| anyhow!("connection refused: {}", url))?;

            let response = HttpResponse {
                status: canned.status,
                headers: canned.headers,
                body: Box::new(Cursor::new(canned.body)),
            };

            if request.follow_redirects && response.is_redirect() {
                hops += 1;
                if hops > AUTO_REDIRECT_LIMIT {
                    bail!("redirect loop at {}", url);
                }
                url = response
                    .header("Location")
                    .ok_or_else(|| anyhow!("redirect without Location from {}", url))?
                    .to_string();
                continue;
            }

            return Ok(response);
        }
    }
}
