//! Authenticating per-port reverse proxies and their lifecycle manager.

pub mod auth;
pub mod error;
pub mod manager;
pub mod server;
pub mod session;

pub use auth::{Authorizer, StaticAuthorizer};
pub use error::{ProxyError, Result};
pub use manager::{LocalPortProxyInfo, ProxyManager, ProxyManagerConfig};
pub use server::{ProxyServer, TlsConfig};
pub use session::{SessionRecord, SessionSecret, SessionStore};
