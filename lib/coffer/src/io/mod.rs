//! Streaming IO: buffers, filter drivers, the filter chain and its two
//! facades, and adapters presenting OS handles as chain endpoints.

pub mod buffer;
pub mod chain;
pub mod filter;
pub mod handle;
pub mod read;
pub mod write;
