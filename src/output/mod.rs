//! Output formatting
//!
//! - `json`: the published artifact
//! - `text`: console report

pub mod json;
pub mod text;
