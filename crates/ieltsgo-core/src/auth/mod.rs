//! Authentication for the IELTSGo client
//!
//! - `TokenSource`: the current bearer credential, read synchronously
//! - File-backed credential storage for the CLI
//! - In-memory source for embedding and tests

pub mod token_store;

pub use token_store::{FileTokenStore, MemoryTokenSource, StoredTokens, TokenSource};
