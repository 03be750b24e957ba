//! Request identity and key derivation.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Key used when a request carries no usable address at all.
pub const UNKNOWN_KEY: &str = "unknown";

/// The identifying attributes of an inbound request.
///
/// Built by the HTTP layer; key derivers and skip predicates only ever see
/// this view of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    /// Raw value of the proxy forwarding header (`X-Forwarded-For`)
    pub forwarded_for: Option<String>,
    /// Client address reported by the fronting proxy (`X-Real-IP`); only
    /// meaningful when that proxy overwrites the client's value
    pub client_addr: Option<String>,
    /// Socket peer address
    pub peer_addr: Option<SocketAddr>,
    /// Matched path parameters and query parameters
    pub params: HashMap<String, String>,
}

impl RequestAttributes {
    /// Attributes for a request seen only through its socket.
    pub fn from_peer(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            ..Self::default()
        }
    }

    /// Set the forwarding header value.
    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Set the connection-reported client address.
    pub fn with_client_addr(mut self, value: impl Into<String>) -> Self {
        self.client_addr = Some(value.into());
        self
    }

    /// Add a path or query parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Look up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Resolve the client address.
    ///
    /// Precedence: first entry of the forwarding header, then the
    /// connection-reported address, then the socket peer.
    pub fn client_address(&self) -> Option<String> {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        if let Some(addr) = forwarded {
            return Some(addr.to_string());
        }

        let reported = self
            .client_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        if let Some(addr) = reported {
            return Some(addr.to_string());
        }

        self.peer_addr.map(|peer| peer.ip().to_string())
    }
}

/// Maps request attributes to an accounting key.
///
/// Implementations must be deterministic, side-effect free, and must always
/// return a non-empty key.
pub trait KeyDeriver: Send + Sync {
    /// Derive the key for this request.
    fn derive(&self, request: &RequestAttributes) -> String;
}

impl<F> KeyDeriver for F
where
    F: Fn(&RequestAttributes) -> String + Send + Sync,
{
    fn derive(&self, request: &RequestAttributes) -> String {
        self(request)
    }
}

/// Default deriver: the client address, or [`UNKNOWN_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAddressKey;

impl KeyDeriver for ClientAddressKey {
    fn derive(&self, request: &RequestAttributes) -> String {
        request
            .client_address()
            .unwrap_or_else(|| UNKNOWN_KEY.to_string())
    }
}

/// Scopes the client address to one resource instance identified by a
/// parameter, e.g. a share token.
///
/// A missing parameter is keyed as `-`, so such requests share one bucket
/// per address rather than escaping accounting.
#[derive(Debug, Clone)]
pub struct PathParamKey {
    param: String,
}

impl PathParamKey {
    /// Combine the client address with the named parameter.
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }

    /// The parameter name.
    pub fn param(&self) -> &str {
        &self.param
    }
}

impl KeyDeriver for PathParamKey {
    fn derive(&self, request: &RequestAttributes) -> String {
        let addr = ClientAddressKey.derive(request);
        let value = request.param(&self.param).unwrap_or("-");
        format!("{}:{}", addr, value)
    }
}

/// Prefixes another deriver's keys with a namespace so that several
/// policies can share one store.
pub struct NamespacedKey<D> {
    namespace: String,
    inner: D,
}

impl<D: KeyDeriver> NamespacedKey<D> {
    /// Wrap `inner`, prefixing its keys with `namespace:`.
    pub fn new(namespace: impl Into<String>, inner: D) -> Self {
        Self {
            namespace: namespace.into(),
            inner,
        }
    }
}

impl<D: KeyDeriver> KeyDeriver for NamespacedKey<D> {
    fn derive(&self, request: &RequestAttributes) -> String {
        format!("{}:{}", self.namespace, self.inner.derive(request))
    }
}
