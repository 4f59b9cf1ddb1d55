//! Native core of an interactive job-control shell.
//!
//! Three cooperating subsystems share a host event loop: the shell
//! [`Session`] (controlling-terminal ownership), the process
//! [`Supervisor`](supervisor::Supervisor) (launching, stream multiplexing,
//! reaping), and the [`EditorBridge`](editor::EditorBridge) (a line editor
//! running concurrently with child output). Workers signal the host through
//! the `notify` closures; the host answers by calling `dispatch` on the
//! owning subsystem.

pub(crate) mod common;
pub(crate) mod cutils;
pub mod editor;
pub(crate) mod log;
pub mod session;
pub mod supervisor;
pub(crate) mod system;

pub use common::{Error, RestoreMode};
pub use log::CoreLogger;
pub use session::Session;
pub use system::interface::ProcessId;
pub use system::signal::SignalNumber;
