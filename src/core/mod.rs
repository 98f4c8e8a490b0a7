//! Storage engine of the config store
//!
//! Leaves first: `record` encodes one record, `io` abstracts the medium,
//! `allocator` hands out chunk runs, `recovery` rebuilds state from an
//! image, `fragment` and `writer` move values on and off the medium,
//! `catalog` indexes live generations and `store` ties them together.

pub mod acl;
pub mod allocator;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod error;
pub mod flags;
pub mod fragment;
pub mod io;
pub mod record;
pub mod recovery;
pub mod store;
pub mod validation;
pub mod writer;
