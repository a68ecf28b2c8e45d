//! Topic record protocol.
//!
//! Line-oriented, receive-only:
//!
//! ```text
//! Server (on accept): 220
//! Client:             <topic>:<value>\r\n
//!
//! Example:
//! Client: email:bob@example.com\r\n
//! ```
//!
//! The topic is everything before the first colon of the line and is matched
//! case-sensitively. Only `email` is acted on: its value is stored on the
//! connection, replacing any earlier one. Lines without a colon and unknown
//! topics are ignored. The server never answers a record.

pub mod parser;

/// Banner sent once on every accepted connection.
pub const GREETING: &[u8] = b"220";
