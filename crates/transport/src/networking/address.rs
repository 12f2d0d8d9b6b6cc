use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use http::Uri;
use tracing::trace;

use crate::networking::AddressError;

const DEFAULT_HTTP_PORT: u16 = 80;

/// The address a listener binds to, parsed from a url like `http://localhost:5000/base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    host: String,
    port: u16,
    path_base: String,
}

impl ServerAddress {
    /// Parses `url`; only the `http` scheme is accepted.
    ///
    /// `+` and `*` as host stand for every local interface. A trailing `/` on the path is
    /// dropped, so `http://host/` and `http://host` have the same empty path base.
    pub fn from_url(url: &str) -> Result<Self, AddressError> {
        let uri = url.parse::<Uri>().map_err(|e| AddressError::invalid_url(url, e))?;

        let scheme = uri.scheme_str().ok_or_else(|| AddressError::invalid_url(url, "missing scheme"))?;
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(AddressError::unsupported_scheme(url, scheme));
        }

        let host = uri.host().filter(|host| !host.is_empty()).ok_or_else(|| AddressError::missing_host(url))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_owned();
        let port = uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
        let path_base = uri.path().trim_end_matches('/').to_owned();

        Ok(Self { host, port, path_base })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path_base(&self) -> &str {
        &self.path_base
    }

    /// Resolves the host to the socket address to bind.
    pub fn resolve(&self) -> Result<SocketAddr, AddressError> {
        let host = self.host.as_str();
        if host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.port));
        }
        if host == "+" || host == "*" {
            return Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        trace!(host, port = self.port, "resolving server address");
        let mut addrs = (host, self.port).to_socket_addrs().map_err(|e| AddressError::unresolvable(host, self.port, e))?;
        addrs.next().ok_or_else(|| AddressError::unresolvable(host, self.port, "no address found"))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "http://[{}]:{}{}", self.host, self.port, self.path_base)
        } else {
            write!(f, "http://{}:{}{}", self.host, self.port, self.path_base)
        }
    }
}
