//! Server configuration.
//!
//! The original option surface was a string-keyed dictionary; here the
//! recognized options are an explicit struct with documented defaults, built
//! with struct-update syntax:
//!
//! ```
//! use embed_web::ServerOptions;
//!
//! let options = ServerOptions {
//!     port: 0, // OS-chosen, read back through `Server::port`
//!     server_name: "demo".to_string(),
//!     ..ServerOptions::default()
//! };
//! ```

use std::collections::HashMap;
use std::time::Duration;

/// Options handed to [`Server::start`](crate::Server::start).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to bind (default: `8080`). `0` asks the OS for a free port,
    /// exposed through [`Server::port`](crate::Server::port) after binding.
    pub port: u16,

    /// Service name handed to the [`ServiceAnnouncer`](crate::ServiceAnnouncer)
    /// (default: `None` = no registration). An empty string asks the
    /// announcer to use the device name.
    pub bonjour_name: Option<String>,

    /// Listen backlog for not-yet-accepted connections (default: `16`).
    pub max_pending_connections: u32,

    /// Value of the `Server` response header (default: `"embed_web"`).
    pub server_name: String,

    /// HTTP authentication demanded of every request (default: `None`).
    pub authentication: Option<Authentication>,

    /// Retry HEAD requests against GET handlers when no HEAD handler
    /// matches, suppressing the response body (default: `true`).
    pub automatically_map_head_to_get: bool,

    /// Window over which connect/disconnect delegate notifications are
    /// merged, in seconds (default: `1.0`). Zero or negative disables
    /// coalescing and fires the events synchronously with the count
    /// transitions.
    pub connected_state_coalescing_interval: f64,

    /// Server-wide cap on request payload size (default: `None`). Requests
    /// over the cap are answered `413` before the handler runs. Per-request
    /// caps on [`BodyKind::Data`](crate::BodyKind::Data) still apply.
    pub maximum_request_body_size: Option<u64>,

    /// Abandon a connection when a socket read stalls longer than this
    /// (default: `None` = wait forever, matching keep-alive semantics).
    pub socket_read_timeout: Option<Duration>,

    /// Abandon a connection when a socket write stalls longer than this
    /// (default: `None`).
    pub socket_write_timeout: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            bonjour_name: None,
            max_pending_connections: 16,
            server_name: "embed_web".to_string(),
            authentication: None,
            automatically_map_head_to_get: true,
            connected_state_coalescing_interval: 1.0,
            maximum_request_body_size: None,
            socket_read_timeout: None,
            socket_write_timeout: None,
            _priv: (),
        }
    }
}

/// HTTP authentication demanded of every request before handler matching.
#[derive(Debug, Clone)]
pub struct Authentication {
    pub method: AuthenticationMethod,
    /// Realm presented in the `WWW-Authenticate` challenge.
    pub realm: String,
    /// Username to plaintext password. Digest HA1 values are derived from
    /// these once at start.
    pub accounts: HashMap<String, String>,
}

/// The challenge scheme for [`Authentication`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// `Authorization: Basic base64(user:pass)` per RFC 7617.
    Basic,
    /// MD5 digest challenge/response with `qop="auth"` per RFC 7616.
    Digest,
}
