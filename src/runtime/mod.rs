//! Candidate-side runtime: environment probe, launch, and the lockdown
//! state machine. Browser APIs are reached through [`storage::ClientStorage`],
//! [`machine::BrowserHost`] and [`transport::LockdownTransport`].

pub mod bootstrap;
pub mod machine;
pub mod probe;
pub mod storage;
pub mod transport;

pub use bootstrap::{launch, Bootstrap, LaunchError};
pub use machine::{BrowserHost, BrowserSignal, KeyPress, LockdownRuntime, Phase, RuntimeConfig};
pub use storage::{ClientStorage, MemoryStorage};
pub use transport::{HttpTransport, LockdownTransport, TransportError};
