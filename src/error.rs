//! Crate-wide error taxonomy.
//!
//! Every failure surfaced across a module boundary is one of these
//! variants; `code()` yields the stable short code used by the CLI error
//! format (`Exception: <code> - <message>`).

use thiserror::Error;

/// Errors produced by the load balancer core.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller violated an API contract (zero size, out-of-range value).
    #[error("{0}")]
    InvalidInput(String),

    /// Configuration failed semantic validation.
    #[error("{0}")]
    Validation(String),

    /// A socket or file syscall failed.
    #[error(transparent)]
    Network(#[from] std::io::Error),

    /// The configuration file does not parse as YAML.
    #[error(transparent)]
    Parse(#[from] serde_yaml::Error),
}

impl Error {
    /// Stable short code for the CLI error format.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::Validation(_) => "validation",
            Error::Network(_) => "network",
            Error::Parse(_) => "parsing",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidInput("x".into()).code(), "invalid_input");
        assert_eq!(Error::Validation("x".into()).code(), "validation");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::Network(io).code(), "network");
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken"))?;
            Ok(())
        }
        assert!(matches!(fails().unwrap_err(), Error::Network(_)));
    }
}
