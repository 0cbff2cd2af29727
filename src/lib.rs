//! Backup ARchiver core: database engine, catalog index, job/schedule
//! engine, bitset and filesystem block-map reader.

pub mod bitset;
pub mod catalog;
pub mod database;
pub mod error;
pub mod filesystem;
pub mod jobs;
