// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error and reply model.
//!
//! Every fallible operation returns [`Result`]. Successful operations that
//! produce user-visible output return a [`Reply`] whose `is_content` flag
//! distinguishes query output (listings, search results, previews) from
//! plain status messages. The CLI-facing numeric code is derived from the
//! error kind via [`Error::code`]; `0` always means success.

use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Bad user input: identifier syntax, name collisions, out-of-range
    /// parameters.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// An on-disk or in-memory consistency check failed: magic mismatch,
    /// slot size mismatch, unknown metadata key, stage counter mismatch.
    #[error("{0}")]
    Invariant(String),

    /// The record store is full and has no tombstone to reuse.
    #[error("{0}")]
    Capacity(String),

    #[error("operation rejected: shutting down")]
    ShuttingDown,

    /// A failure inside the embedded KV layer.
    #[error("index error: {0}")]
    Index(String),

    #[error("{0}")]
    Parse(String),
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Stable nonzero code per error kind, surfaced by the CLI.
    pub fn code(&self) -> i32 {
        match self {
            Error::Validation(_) => 2,
            Error::NotFound(_) => 3,
            Error::Io { .. } => 4,
            Error::Invariant(_) => 5,
            Error::Capacity(_) => 6,
            Error::ShuttingDown => 7,
            Error::Index(_) => 8,
            Error::Parse(_) => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Successful-operation payload: a message plus a flag telling the caller
/// whether the message is query content or a diagnostic/status line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub message: String,
    pub is_content: bool,
}

impl Reply {
    /// Empty success, nothing to print.
    pub fn none() -> Self {
        Reply::default()
    }

    /// A status line ("Successfully created …").
    pub fn status(message: impl Into<String>) -> Self {
        Reply {
            message: message.into(),
            is_content: false,
        }
    }

    /// User-visible query output.
    pub fn content(message: impl Into<String>) -> Self {
        Reply {
            message: message.into(),
            is_content: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_nonzero() {
        assert_eq!(Error::Validation("x".into()).code(), 2);
        assert_eq!(Error::NotFound("x".into()).code(), 3);
        assert_eq!(
            Error::io("/nope", io::Error::from(io::ErrorKind::NotFound)).code(),
            4
        );
        assert_eq!(Error::ShuttingDown.code(), 7);
    }

    #[test]
    fn reply_flags() {
        assert!(!Reply::status("ok").is_content);
        assert!(Reply::content("1, 2, 3").is_content);
        assert!(Reply::none().message.is_empty());
    }
}
