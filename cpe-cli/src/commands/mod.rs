//! CLI command implementations.
//!
//! - [`run`] - Run a descriptor to completion
//! - [`worker`] - Host one stage type for a fenced deployment

pub mod run;
pub mod worker;
