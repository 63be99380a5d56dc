//! Transport launchers for kmux.
//!
//! - [`ProcessTransportLauncher`] runs the multiplexing transport as a child
//!   process speaking JSON lines.
//! - [`LoopbackLauncher`] keeps the far end in-process as a [`LoopbackPeer`].

pub mod loopback;
pub mod process;

pub use loopback::{LoopbackLauncher, LoopbackPeer};
pub use process::ProcessTransportLauncher;
