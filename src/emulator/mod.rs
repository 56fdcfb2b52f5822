//! Local stand-in for the freee API: a SQLite store, the wallet txn matcher, and an axum server.

pub mod matching;
pub mod server;
pub mod store;
