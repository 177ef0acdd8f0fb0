// error.rs: Error taxonomy for asset, save and configuration loading.
//
// Only load paths return errors. Broken invariants inside the simulation are
// debug assertions and degenerate geometry yields ordinary query results.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OzError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{what}: unexpected end of data at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    #[error("{what}: {reason}")]
    BadAsset { what: &'static str, reason: String },

    #[error("{what}: expected size {expected}, found {found}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

pub type OzResult<T> = Result<T, OzError>;

impl OzError {
    pub fn bad_asset(what: &'static str, reason: impl Into<String>) -> Self {
        OzError::BadAsset {
            what,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = OzError::Truncated { what: "bsp", offset: 12 };
        assert_eq!(e.to_string(), "bsp: unexpected end of data at offset 12");

        let e = OzError::SizeMismatch { what: "terra", expected: 256, found: 8 };
        assert_eq!(e.to_string(), "terra: expected size 256, found 8");
    }

    #[test]
    fn test_io_error_converts() {
        fn open() -> OzResult<()> {
            std::fs::read("/nonexistent/oz/file.bin")?;
            Ok(())
        }
        assert!(matches!(open(), Err(OzError::Io(_))));
    }
}
