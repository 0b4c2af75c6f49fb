//! Genesys Core
//!
//! Core library for the Genesys Cloud provider: the provider abstraction,
//! the resource/state model and the retry primitives every resource
//! operation relies on for eventually consistent reads.

pub mod consistency;
pub mod provider;
pub mod resource;
pub mod retry;
