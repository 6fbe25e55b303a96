use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::version::VersionTriple;

/// One release as served by the GitHub releases API. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// The feed endpoint returns either one release object or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Feed {
    Many(Vec<Release>),
    One(Release),
}

impl Release {
    pub fn version(&self) -> VersionTriple {
        VersionTriple::parse(&self.tag_name)
    }

    /// Asset with exactly this name
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

impl Feed {
    #[cfg(feature = "std")]
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn into_releases(self) -> Vec<Release> {
        match self {
            Feed::Many(releases) => releases,
            Feed::One(release) => alloc::vec![release],
        }
    }
}
