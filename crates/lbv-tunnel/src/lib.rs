//! LogonBox VPN - Userspace WireGuard Tunnel Manager
//!
//! Parses WireGuard configuration text, brings tunnels up and down, and
//! reports failures through numeric error codes that stay readable from
//! callers which only hold handles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      TunnelManager                        │
//! │                                                           │
//! │  ┌──────────────────────────────────────────────────┐     │
//! │  │ Context (runtime, search path, last error)        │     │
//! │  │                                                   │     │
//! │  │  source ──▶ search ──▶ parser ──▶ SessionStore    │     │
//! │  │                                      │            │     │
//! │  │                                      ▼            │     │
//! │  │                              WireGuardEngine      │     │
//! │  │                               │      │            │     │
//! │  │                          PeerTunnel PeerTunnel    │     │
//! │  └───────────────────────────────│──────│────────────┘     │
//! └──────────────────────────────────│──────│──────────────────┘
//!                                    ▼ UDP  ▼
//!                          ┌────────────┐ ┌────────────┐
//!                          │ WireGuard  │ │ WireGuard  │
//!                          │   Peer     │ │   Peer     │
//!                          └────────────┘ └────────────┘
//! ```
//!
//! # Features
//!
//! - **Config Parser**: `[Interface]`/`[Peer]` text to a typed [`Configuration`]
//! - **Session Store**: opaque handles, concurrent up/down, teardown states
//! - **Tunnel Engine**: WireGuard sessions over UDP via boringtun, no TUN device
//! - **Error Reporter**: per-context last error code
//!
//! # Security
//!
//! - All traffic encrypted with ChaCha20-Poly1305
//! - Perfect forward secrecy via X25519 key exchange
//! - Private keys never printed by `Debug`

mod config;
mod context;
mod engine;
mod error;
mod keys;
mod parser;
mod routes;
mod search;
mod session;
mod system;
mod tunnel;

pub use config::{Configuration, DnsEntry, Endpoint, InterfaceConfig, PeerConfig, DEFAULT_PORT};
pub use context::{Context, ContextHandle, ContextOptions, TunnelManager};
pub use engine::{
    ActiveTunnel, Connectivity, PeerStatus, TunnelEngine, WireGuardEngine, WireGuardTunnel,
    DEFAULT_MTU,
};
pub use error::{ContextError, EngineError, ErrorCode, LastError, ParseError, TunnelError};
pub use keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use parser::parse;
pub use routes::RouteTable;
pub use search::{load_source, LoadedSource, SearchPath, CONFIG_PATH_ENV};
pub use session::{SessionHandle, SessionInfo, SessionStatus, SessionStore};
pub use system::{ConfigFormat, SystemConfigError, SystemConfiguration};
pub use tunnel::{TunnelState, TunnelStats};
