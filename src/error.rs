use common::{SignatureFormatError, VersionTriple};
use thiserror::Error;

/// How a failure should be treated by whoever scheduled the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abandon this attempt, nothing was mutated, try again next cycle
    Transient,
    /// Integrity check failed; the written slot is never booted
    Verification,
    /// KV store open/read/write/commit failed
    Store,
    /// Flash read/write/erase failed
    Flash,
    /// Nothing sensible left to do but restart into whatever is there
    Fatal,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("request to {url} failed: {cause:#}")]
    Network { url: String, cause: anyhow::Error },

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("gave up after {limit} redirects starting at {url}")]
    TooManyRedirects { url: String, limit: u8 },

    #[error("redirect {status} from {url} carried no Location header")]
    MissingLocation { url: String, status: u16 },

    #[error("refusing content type {content_type:?} from {url}")]
    UnexpectedContentType { url: String, content_type: String },

    #[error("release feed could not be parsed: {0}")]
    MalformedFeed(String),

    #[error("no qualifying release found for {repo}")]
    NoRelease { repo: String },

    #[error("release {tag} has no asset named {name}")]
    MissingAsset { tag: String, name: String },

    #[error("no update source configured")]
    NoUpdateSource,

    #[error(transparent)]
    SignatureFormat(#[from] SignatureFormatError),

    #[error("signed image length {signed} does not match slot metadata length {actual}")]
    LengthMismatch { signed: u32, actual: u32 },

    #[error("digest mismatch in slot {slot}: signed {expected}, computed {computed}")]
    DigestMismatch {
        slot: String,
        expected: String,
        computed: String,
    },

    #[error("slot {slot} holds no valid image")]
    MissingImage { slot: String },

    #[error("image does not fit slot {slot} ({capacity} bytes)")]
    ImageTooLarge { slot: String, capacity: u32 },

    #[error("persistent store {op} failed for {namespace}/{key}: {cause:#}")]
    Store {
        op: &'static str,
        namespace: &'static str,
        key: &'static str,
        cause: anyhow::Error,
    },

    #[error("flash {op} failed on {slot}: {cause:#}")]
    Flash {
        op: &'static str,
        slot: String,
        cause: anyhow::Error,
    },

    #[error("no free application slot (running from {running})")]
    NoFreeSlot { running: String },

    #[error("slot {0} not found")]
    SlotNotFound(String),

    #[error("no application slot holds version {0}")]
    VersionNotFound(VersionTriple),

    #[error("factory slot is absent")]
    FactorySlotMissing,

    #[error("{op} failed: {cause:#}")]
    Platform { op: &'static str, cause: anyhow::Error },
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        use LifecycleError::*;

        match self {
            Network { .. }
            | HttpStatus { .. }
            | TooManyRedirects { .. }
            | MissingLocation { .. }
            | UnexpectedContentType { .. }
            | MalformedFeed(_)
            | NoRelease { .. }
            | MissingAsset { .. }
            | NoUpdateSource
            | Platform { .. } => ErrorKind::Transient,
            SignatureFormat(_)
            | LengthMismatch { .. }
            | DigestMismatch { .. }
            | MissingImage { .. }
            | ImageTooLarge { .. } => ErrorKind::Verification,
            Store { .. } => ErrorKind::Store,
            Flash { .. } => ErrorKind::Flash,
            NoFreeSlot { .. } | SlotNotFound(_) | VersionNotFound(_) | FactorySlotMissing => {
                ErrorKind::Fatal
            }
        }
    }

    pub(crate) fn network(url: &str, cause: impl Into<anyhow::Error>) -> Self {
        LifecycleError::Network {
            url: url.to_string(),
            cause: cause.into(),
        }
    }

    pub(crate) fn store(
        op: &'static str,
        namespace: &'static str,
        key: &'static str,
        cause: anyhow::Error,
    ) -> Self {
        LifecycleError::Store {
            op,
            namespace,
            key,
            cause,
        }
    }

    pub(crate) fn flash(op: &'static str, slot: &str, cause: anyhow::Error) -> Self {
        LifecycleError::Flash {
            op,
            slot: slot.to_string(),
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LifecycleError::NoRelease {
                repo: "acme/lamp".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LifecycleError::from(SignatureFormatError { received: 12 }).kind(),
            ErrorKind::Verification
        );
        assert_eq!(
            LifecycleError::flash("erase", "ota_0", anyhow::anyhow!("timeout")).kind(),
            ErrorKind::Flash
        );
        assert_eq!(LifecycleError::FactorySlotMissing.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_store_error_keeps_cause() {
        let err = LifecycleError::store(
            "commit",
            "restart-state",
            "count",
            anyhow::anyhow!("nvs full"),
        );
        assert_eq!(
            err.to_string(),
            "persistent store commit failed for restart-state/count: nvs full"
        );
    }
}
