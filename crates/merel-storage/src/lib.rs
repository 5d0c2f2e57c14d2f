//! merel-storage: the per-account message store.
//!
//! Content-addressed immutable message files, a SQLite metadata database
//! per account, per-account reader/writer locking and the trainable junk
//! filter.

pub mod account;
pub mod bloom;
pub mod db;
pub mod file;
pub mod junk;
pub mod models;
pub mod store;

pub use account::Account;
pub use junk::{Classification, JunkFilter};
pub use models::{Mailbox, Message, Recipient};
pub use store::Store;
