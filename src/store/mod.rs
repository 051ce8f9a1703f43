//! Filesystem-backed records shared by the control plane and worker processes.

pub mod atomic;
pub mod channel;
pub mod credentials;

pub use channel::{ChannelConfig, ChannelConfigStore};
pub use credentials::{BotCredential, ChannelCredential, CredentialStore};
