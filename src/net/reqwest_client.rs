use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::redirect::Policy;

use crate::platform::{HttpClient, HttpRequest, HttpResponse};

const TIMEOUT: Duration = Duration::from_secs(30);

/// `reqwest::blocking` behind [`HttpClient`].
///
/// Holds two clients because reqwest fixes the redirect policy per client:
/// one that follows redirects for feed requests and one that hands 3xx
/// responses back for the core to follow.
pub struct ReqwestHttp {
    following: Client,
    manual: Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self> {
        let following = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let manual = Client::builder()
            .timeout(TIMEOUT)
            .redirect(Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { following, manual })
    }
}

impl HttpClient for ReqwestHttp {
    fn get(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.manual
        };

        let mut builder = client.get(request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, *value);
        }
        let response = builder
            .send()
            .with_context(|| format!("GET {}", request.url))?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Ok(HttpResponse {
            status: response.status().as_u16(),
            headers,
            body: Box::new(response),
        })
    }
}
