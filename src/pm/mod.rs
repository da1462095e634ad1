//! Process management: the host/guest control plane and the app spawner.
//!
//! The host-guest model holds communication between all apps running on
//! the same machine. It exists primarily so the CLI can send control
//! commands to the apps, and so crashed apps can be revived.

pub mod control;
pub mod guest;
pub mod host;
pub mod rendezvous;
pub mod spawn;
pub mod stats;
pub mod wire;

/// The pseudo-app name for an ephemeral CLI connection. Excluded from
/// broadcasts and revival.
pub const CLI_APP: &str = ":cli";

pub use control::ControlClient;
pub use guest::{Guest, GuestState};
pub use host::Host;
