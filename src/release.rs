//! Picks one release from a GitHub-shaped feed

use std::io::Read;

use common::{Feed, Release, VersionTriple};

use crate::config::UpdateConfig;
use crate::error::LifecycleError;
use crate::platform::{HttpClient, HttpRequest};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// The release chosen for one update attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub version: VersionTriple,
    pub firmware_url: String,
    pub signature_url: String,
}

pub struct ReleaseResolver<'a> {
    http: &'a mut dyn HttpClient,
    config: &'a UpdateConfig,
}

impl<'a> ReleaseResolver<'a> {
    pub fn new(http: &'a mut dyn HttpClient, config: &'a UpdateConfig) -> Self {
        Self { http, config }
    }

    pub fn latest_url(&self, repo: &str) -> String {
        format!(
            "{}/repos/{}/releases/latest",
            self.config.api_base.trim_end_matches('/'),
            repo
        )
    }

    pub fn list_url(&self, repo: &str) -> String {
        format!(
            "{}/repos/{}/releases?per_page={}",
            self.config.api_base.trim_end_matches('/'),
            repo,
            self.config.release_list_len
        )
    }

    pub fn resolve(&mut self, repo: &str, prerelease: bool) -> Result<ReleaseDescriptor, LifecycleError> {
        info!(
            "release: Resolving {} release of {}",
            if prerelease { "newest" } else { "latest stable" },
            repo
        );

        let release = if prerelease {
            let releases = self.fetch(&self.list_url(repo))?;
            pick(releases, false)
        } else {
            let latest = self.fetch(&self.latest_url(repo))?;
            match latest.as_slice() {
                [single] if !single.prerelease => pick(latest, true),
                _ => {
                    warn!("release: latest endpoint returned a prerelease or a list, scanning releases");
                    let releases = self.fetch(&self.list_url(repo))?;
                    pick(releases, true)
                }
            }
        };

        let release = release.ok_or_else(|| LifecycleError::NoRelease {
            repo: repo.to_string(),
        })?;
        self.describe(release)
    }

    fn fetch(&mut self, url: &str) -> Result<Vec<Release>, LifecycleError> {
        debug!("release: GET {}", url);
        let request = HttpRequest::get(url)
            .header("User-Agent", &self.config.user_agent)
            .header("Accept", GITHUB_ACCEPT)
            .follow_redirects(true);
        let response = self
            .http
            .get(&request)
            .map_err(|e| LifecycleError::network(url, e))?;

        if !(200..300).contains(&response.status) {
            return Err(LifecycleError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let limit = self.config.max_feed_bytes;
        let mut body = Vec::new();
        response
            .body
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| LifecycleError::network(url, e))?;
        if body.len() > limit {
            return Err(LifecycleError::MalformedFeed(format!(
                "feed from {} exceeds {} bytes",
                url, limit
            )));
        }

        Feed::from_json(&body)
            .map(Feed::into_releases)
            .map_err(|e| LifecycleError::MalformedFeed(e.to_string()))
    }

    fn describe(&self, release: Release) -> Result<ReleaseDescriptor, LifecycleError> {
        let firmware_name = &self.config.firmware_asset;
        let signature_name = self.config.signature_asset();

        let firmware = release
            .asset(firmware_name)
            .ok_or_else(|| LifecycleError::MissingAsset {
                tag: release.tag_name.clone(),
                name: firmware_name.clone(),
            })?;
        let signature = release
            .asset(&signature_name)
            .ok_or_else(|| LifecycleError::MissingAsset {
                tag: release.tag_name.clone(),
                name: signature_name.clone(),
            })?;

        let descriptor = ReleaseDescriptor {
            tag: release.tag_name.clone(),
            version: release.version(),
            firmware_url: firmware.browser_download_url.clone(),
            signature_url: signature.browser_download_url.clone(),
        };
        info!("release: Selected {} ({})", descriptor.tag, descriptor.version);
        Ok(descriptor)
    }
}

/// First release with a usable tag; `stable_only` also skips prereleases.
/// Feeds list newest first.
fn pick(releases: Vec<Release>, stable_only: bool) -> Option<Release> {
    releases.into_iter().find(|release| {
        if stable_only && release.prerelease {
            return false;
        }
        if !release.version().is_valid() {
            warn!("release: Skipping {:?}, tag is not a version", release.tag_name);
            return false;
        }
        true
    })
}
