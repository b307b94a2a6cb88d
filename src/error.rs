use nix::errno::Errno;
use thiserror::Error;

/// Failures a stressor can report back to the dispatcher.
///
/// Every fatal condition carries the stressor name and the failing
/// operation so the log line identifies which worker gave up and why.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{name}: {op} failed: {source}")]
    Sys {
        name: String,
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error("{name}: {op} failed: {source}")]
    Io {
        name: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("option {option}={value} out of range {min}..={max}")]
    Config {
        option: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

impl Error {
    pub fn sys(name: &str, op: &'static str, source: Errno) -> Self {
        Error::Sys {
            name: name.to_string(),
            op,
            source,
        }
    }

    pub fn io(name: &str, op: &'static str, source: std::io::Error) -> Self {
        Error::Io {
            name: name.to_string(),
            op,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
