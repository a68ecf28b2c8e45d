//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `topic`: `topic:value` records, storing the `email` topic per connection

pub mod topic;
