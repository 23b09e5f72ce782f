//! Implementations of [`super::BlobStore`].
//!
//! [`in_mem`] is for tests, [`local`] keeps one file per blob in a
//! directory and [`sqlite`] keeps every blob in a single database
//! file.

pub mod in_mem;
pub mod local;
pub mod sqlite;
