// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a build. Every variant is fatal; nothing is retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{message}\n  hint: {remediation}")]
    Precondition {
        message: String,
        remediation: String,
    },

    #[error("loading hive {key} from {path:?} failed with status {status}")]
    HiveLoad {
        key: String,
        path: PathBuf,
        status: i32,
    },

    #[error("unloading hive {key} failed with status {status}")]
    HiveUnload { key: String, status: i32 },

    /// The external tool reported success but the filesystem disagrees.
    #[error("validation of {path:?} failed: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BuildError {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BuildError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
