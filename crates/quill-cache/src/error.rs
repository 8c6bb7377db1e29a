// Copyright 2025 The Quill Authors
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

use std::io;

use thiserror::Error;

/// Result alias used throughout the cache.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// All the ways the cache can fail.
///
/// Absent values are never errors: looking up a room, event or user that was
/// never stored yields `Ok(None)` or an empty collection.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `client()` was called before `init()` succeeded.
    #[error("the cache has not been initialized yet")]
    DatabaseUninitialized,

    /// `init()` was called while a cache is already live for this process.
    #[error("the cache has already been initialized for this session")]
    AlreadyInitialized,

    #[error("failed to open the cache database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error(transparent)]
    Table(#[from] redb::TableError),

    #[error(transparent)]
    Storage(#[from] redb::StorageError),

    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),

    #[error(transparent)]
    Commit(#[from] redb::CommitError),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The on-disk format is newer than this build understands.
    #[error("cache format version {found} is newer than the supported version {supported}")]
    UnsupportedFormat { found: u64, supported: u64 },

    /// The OS keychain rejected or failed an operation. Internal secrets are
    /// unaffected by this class of failure.
    #[error("keychain operation failed: {0}")]
    Keychain(String),

    /// Sealing or opening an internal secret failed, usually because the
    /// pickle secret is not loaded yet.
    #[error("sealing or opening an internal secret failed")]
    SecretSeal,

    #[error(transparent)]
    Io(#[from] io::Error),
}
