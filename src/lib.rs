//! Bridge between the hardware front panel (HMI), speaking a framed
//! command protocol over a serial link, and the audio host process on the
//! other side of a shared-memory ring.
//!
//! The daemon binary lives in `main.rs`; everything else is exported here
//! so the audio host side can link the same ring/event code and so the
//! integration tests can drive each subsystem directly.

pub mod api;
pub mod audioproc;
pub mod daemon;
pub mod dispatch;
pub mod exec;
pub mod framing;
pub mod hmi;
pub mod host;
pub mod mixer;
pub mod port;
pub mod ring;

pub use daemon::{Daemon, Paths};
pub use host::HostClient;
