//! HTTP request handlers organized by domain
//!
//! Each submodule contains handlers for a specific API area.

pub mod batches;
pub mod chart;
pub mod classify;
pub mod health;
pub mod layout;
pub mod rules;

// Re-export all handlers for use in router
pub use batches::*;
pub use chart::*;
pub use classify::*;
pub use health::*;
pub use layout::*;
pub use rules::*;
