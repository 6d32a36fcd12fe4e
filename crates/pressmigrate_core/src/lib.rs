//! Batch record transformations for moving legacy publisher content into a
//! common content schema.

pub mod blocks;
pub mod config;
pub mod delimited;
pub mod error;
pub mod media;
pub mod outcome_log;
pub mod pipeline;
pub mod record;
pub mod remote;
pub mod runtime;
pub mod store;
pub mod transforms;
pub mod url_map;
