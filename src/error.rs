use std::path::PathBuf;

use crate::subnet::{Role, Subnet};

#[derive(thiserror::Error, Debug)]
pub enum SubnetError {
    #[error("invalid subnet format {input:?}: {reason}")]
    InvalidSubnetFormat { input: String, reason: String },

    #[error("subnet {candidate} overlaps with existing subnet {existing}{}", .name.as_ref().map(|n| format!(" ({})", n)).unwrap_or_default())]
    Overlap {
        candidate: Subnet,
        existing: Subnet,
        name: Option<String>,
    },

    #[error("{} not found in subnet registry", .0.name())]
    MissingRole(Role),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubnetError {
    pub(crate) fn invalid(input: &str, reason: impl Into<String>) -> Self {
        SubnetError::InvalidSubnetFormat {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("subnet registry {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("subnet registry {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("subnet registry {} line {line}: {reason}", .path.display())]
    CorruptRecord {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}
