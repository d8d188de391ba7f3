//! Document store for the gateway control plane.
//!
//! The data plane only needs one guarantee from this crate: an atomic
//! read-modify-write per document, exposed as
//! [`MemStore::touch_and_count`]. Everything else is plain CRUD for the
//! auth/apps/admin surfaces.

pub mod mem;
pub mod model;

use thiserror::Error;

pub use mem::{MemStore, TouchOutcome};
pub use model::{
    App, AppPatch, Chain, ChainPatch, DefaultAppSettings, NewApp, User, UserPatch,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
