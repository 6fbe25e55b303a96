//! `HttpClient` on `EspHttpConnection`, TLS through the certificate bundle

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use embedded_svc::http::client::Method;
use embedded_svc::http::{Headers, Status};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection, FollowRedirectsPolicy};
use log::debug;

use esp32_lifecycle::platform::{HttpClient, HttpRequest, HttpResponse};

/// Response headers the core looks at. The connection only answers lookups
/// by name, it cannot list what it received.
const KEPT_HEADERS: [&str; 3] = ["Location", "Content-Type", "Content-Length"];

/// Owns the connection so the body can outlive the call
struct Body(EspHttpConnection);

impl io::Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        embedded_svc::io::Read::read(&mut self.0, buf).map_err(|e| io::Error::other(format!("{:?}", e)))
    }
}

pub struct EspHttp {
    timeout: Duration,
}

impl EspHttp {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for EspHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for EspHttp {
    fn get(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let mut connection = EspHttpConnection::new(&Configuration {
            buffer_size: Some(4096),
            // Signed storage URLs from a redirect run to several kilobytes
            buffer_size_tx: Some(8192),
            timeout: Some(self.timeout),
            follow_redirects_policy: if request.follow_redirects {
                FollowRedirectsPolicy::FollowGetHead
            } else {
                FollowRedirectsPolicy::FollowNone
            },
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .context("Failed to create HTTP connection")?;

        connection
            .initiate_request(Method::Get, request.url, &request.headers)
            .with_context(|| format!("Failed to send GET {}", request.url))?;
        connection
            .initiate_response()
            .with_context(|| format!("No response from {}", request.url))?;

        let status = connection.status();
        let headers = KEPT_HEADERS
            .iter()
            .filter_map(|name| {
                connection
                    .header(name)
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        debug!("http: {} -> {}", request.url, status);

        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(Body(connection)),
        })
    }
}
