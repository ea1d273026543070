//! Domain model for the workflow engine.

pub mod request;
