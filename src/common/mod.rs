pub mod error;

pub use error::Error;

/// How pending terminal output/input is treated when terminal attributes are
/// reapplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Apply immediately (`TCSANOW`).
    Now,
    /// Apply after all queued output has been written (`TCSADRAIN`).
    #[default]
    Drain,
    /// Apply after draining output and discard queued input (`TCSAFLUSH`).
    Flush,
}

impl RestoreMode {
    pub(crate) fn flags(self) -> libc::c_int {
        match self {
            RestoreMode::Now => libc::TCSANOW,
            RestoreMode::Drain => libc::TCSADRAIN,
            RestoreMode::Flush => libc::TCSAFLUSH,
        }
    }
}
