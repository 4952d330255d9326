// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error taxonomy shared by every KMPP operation.
//!
//! All failures collapse into a single negative integer domain through
//! [`Error::code`], matching the result codes used on the privileged side so
//! that a value can travel across the transaction boundary unchanged.

use thiserror::Error;

/// Generic failure.
pub const KMPP_NOK: i32 = -1;
/// A required handle was absent.
pub const KMPP_ERR_NULL_PTR: i32 = -3;
/// A name or value could not be resolved.
pub const KMPP_ERR_VALUE: i32 = -6;
/// The operation is not permitted from this side.
pub const KMPP_ERR_PERM: i32 = -9;
/// Wrong life-cycle state for the requested operation.
pub const KMPP_ERR_INIT: i32 = -1002;
/// Schema or layout does not match.
pub const KMPP_ERR_PROTOL: i32 = -1007;
/// Out of memory, capacity or reference counts.
pub const KMPP_ERR_NOMEM: i32 = -1006;
/// Ring buffer cannot take the request.
pub const KMPP_ERR_BUFFER_FULL: i32 = -1012;
/// Allocator or device I/O failure.
pub const KMPP_ERR_OPEN_FILE: i32 = -5;

/// The main error type for KMPP operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An object, field table or buffer handle was missing.
    #[error("null handle")]
    NullPointer,

    /// A schema or field name could not be resolved.
    #[error("{0} not found")]
    NotFound(String),

    /// Use after release, or an object in the wrong life-cycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Pool empty, trie capacity exceeded or reference count overflow.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The privileged side returned a non-zero result.
    #[error("transaction failed with code {0}")]
    TransactionFailure(i32),

    /// A field location or layout used against the wrong schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Feature, hook or access mode not available.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A trie entry or schema with the same name is already present.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Ring buffer reservation larger than the free space.
    #[error("buffer full: requested {requested} bytes, {available} available")]
    BufferFull { requested: usize, available: usize },

    /// Allocator, mmap or device failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps the error into the shared negative result-code domain.
    pub fn code(&self) -> i32 {
        match self {
            Error::NullPointer => KMPP_ERR_NULL_PTR,
            Error::NotFound(_) => KMPP_ERR_VALUE,
            Error::InvalidState(_) => KMPP_ERR_INIT,
            Error::ResourceExhausted(_) => KMPP_ERR_NOMEM,
            Error::TransactionFailure(code) if *code < 0 => *code,
            Error::TransactionFailure(_) => KMPP_NOK,
            Error::SchemaMismatch(_) => KMPP_ERR_PROTOL,
            Error::Unsupported(_) => KMPP_ERR_PERM,
            Error::AlreadyExists(_) => KMPP_NOK,
            Error::BufferFull { .. } => KMPP_ERR_BUFFER_FULL,
            Error::Io(_) => KMPP_ERR_OPEN_FILE,
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        Error::SchemaMismatch(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }
}

/// Converts a result into the shared integer domain: `0` on success.
pub fn to_code<T>(res: &Result<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
