//! Control plane state for the burrow gateway
//!
//! Each structure here is an explicitly constructed, independently locked
//! object handed to the components that need it: the session registry, the
//! key store, the UDP pseudo-session table and the per-rule IO counters.

pub mod counters;
pub mod keys;
pub mod listener;
pub mod registry;
pub mod task_tracker;
pub mod udp_sessions;

pub use counters::{CounterSnapshot, IoCounters};
pub use keys::KeyStore;
pub use listener::{accept_backoff, ListenerHandle, ACCEPT_RETRY_DELAY};
pub use registry::{RegistryError, Session, SessionRegistry};
pub use task_tracker::TaskTracker;
pub use udp_sessions::{UdpSession, UdpSessionTable, DEFAULT_UDP_IDLE_TIMEOUT};
