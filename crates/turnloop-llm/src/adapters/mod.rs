//! Reference `StreamFn` adapters.
//!
//! Concrete wire adapters are not part of the core contract — see the
//! module-level non-goals. `anthropic` ships as a grounded usage example
//! and as a fixture the integration tests can point a mock server at; it is
//! not required by anything in `turnloop-agent`.

pub mod anthropic;

pub use anthropic::AnthropicStreamFn;
