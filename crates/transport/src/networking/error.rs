use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("handle is closing or disposed")]
    Disposed,

    #[error("operation aborted, the handle was closed before it completed")]
    Aborted,

    #[error("invalid handle state: {reason}")]
    InvalidState { reason: String },

    #[error("address error: {source}")]
    Address {
        #[from]
        source: AddressError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl NetError {
    pub fn invalid_state<S: ToString>(str: S) -> Self {
        Self::InvalidState { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Whether the failure only reflects that the handle was closed underneath the operation
    pub fn is_aborted(&self) -> bool {
        matches!(self, NetError::Aborted)
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("missing host in url {url:?}")]
    MissingHost { url: String },

    #[error("unsupported scheme {scheme:?} in url {url:?}")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("can't resolve {host}:{port}: {reason}")]
    Unresolvable { host: String, port: u16, reason: String },
}

impl AddressError {
    pub fn invalid_url<U: ToString, S: ToString>(url: U, reason: S) -> Self {
        Self::InvalidUrl { url: url.to_string(), reason: reason.to_string() }
    }

    pub fn missing_host<U: ToString>(url: U) -> Self {
        Self::MissingHost { url: url.to_string() }
    }

    pub fn unsupported_scheme<U: ToString, S: ToString>(url: U, scheme: S) -> Self {
        Self::UnsupportedScheme { url: url.to_string(), scheme: scheme.to_string() }
    }

    pub fn unresolvable<H: ToString, S: ToString>(host: H, port: u16, reason: S) -> Self {
        Self::Unresolvable { host: host.to_string(), port, reason: reason.to_string() }
    }
}
