//! Intercepting proxy for a fleet-management control plane.
//!
//! Clients are pointed at the proxy instead of the real control server. The
//! proxy answers key discovery with its own keys, terminates each client's
//! secure session, and opens a matching session to the real server using a
//! per-client substitute identity. Requests and responses are relayed and
//! logged; streamed map responses are decoded, stripped of the upstream dial
//! plan, and re-encoded record by record.
//!
//! ## Example Flow
//!
//! ```text
//! 1. Client: GET /key?v=68            -> proxy's legacy and noise public keys
//! 2. Client: POST /ts2021 (upgrade)   -> proxy accepts, learns client key K
//! 3. Proxy: substitute S = store[K]   -> created and persisted on first sight
//! 4. Proxy: dials upstream as S       -> then replies 101 to the client
//! 5. Client: POST /machine/map        -> records streamed back, dial plan removed
//! ```

pub mod args;
pub mod body;
pub mod bridge;
pub mod config;
pub mod dump;
pub mod error;
pub mod frame;
pub mod key;
pub mod legacy;
pub mod mappoll;
pub mod noise;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{CodecError, FrameError, SessionError, StoreError};
pub use key::{MachinePrivate, MachinePublic};
pub use server::{run_server, Proxy};
pub use state::IdentityStore;
