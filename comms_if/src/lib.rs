//! # Communications interface crate.
//!
//! Provides all common communications interfaces between the car and its operators.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Control messages and the command records they are parsed into
pub mod tc;

/// Telemetry records sent to the operator
pub mod tm;

/// Network module
pub mod net;
