//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for sharing requests:
//! - Request types and states (typestate pattern)
//! - State transition methods, committed through the store's CAS
//! - Value objects (RequestData, ids, category, urgency)

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
