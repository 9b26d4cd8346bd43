//! Schema translation between the Messages API and chat completions.

pub mod request;
pub mod response;
pub mod thinking;
