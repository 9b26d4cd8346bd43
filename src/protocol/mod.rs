//! Wire types for both sides of the bridge.
//!
//! `anthropic` is what clients speak to us; `openai` is what we speak to the
//! backend. Everything here is plain serde data with no conversion logic.

pub mod anthropic;
pub mod openai;
