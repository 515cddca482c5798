//! SOCKS4 and SOCKS4a proxy server.
//!
//! Every accepted connection sends one request. CONNECT requests are dialed
//! and relayed, BIND requests are rejected, and malformed requests are
//! closed without a reply. Application code can take requests over through
//! [`SOCKS4Server::subscribe`] and answer them itself.

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::Config;
pub use error::{ProxyError, RequestError};
pub use protocol::{Command, Status};
pub use server::dispatch::{Dispatcher, Interest, Requests};
pub use server::process;
pub use server::proxy::{proxy_request, ProxyOutcome, Relay, Transferred};
pub use server::request::{Request, RequestEvent, HANDSHAKE_TIMEOUT};
pub use server::SOCKS4Server;
