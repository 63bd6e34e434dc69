#![forbid(unsafe_code)]

pub mod lineage;
pub mod repo;
pub mod sqlite;
