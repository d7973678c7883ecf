// Copyright 2025 HEM Sp. z o.o.
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

use thiserror::Error;

/// Errors produced by the external device manager.
///
/// Collaborator failures that must not leak to clients (package scans,
/// per-row descriptor parsing during matching) are logged at the call site
/// and do not surface through this type.
#[derive(Debug, Error)]
pub enum EdmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The driver extension component could not be resolved yet. This is
    /// the only error the automatic connect path retries; packages are
    /// often still being installed when their device is first seen.
    #[error("driver extension component not resolvable: {0}")]
    ComponentNotResolvable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An object is in the wrong state for the requested operation, e.g. a
    /// connect on a notifier that already has a live connection record.
    #[error("invalid object state: {0}")]
    InvalidObject(String),

    #[error("package store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("driver descriptor failure: {0}")]
    Descriptor(#[from] serde_json::Error),
}

pub type EdmResult<T> = Result<T, EdmError>;
