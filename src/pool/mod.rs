//! Connection pooling for the wire protocols
//!
//! One [`imap::ImapPool`] and one [`smtp::SmtpPool`] are shared across
//! all IMAP accounts; Gmail accounts talk HTTP and do not use either.

pub mod imap;
pub mod smtp;

pub use imap::{ImapConnection, ImapPool, ImapSession};
pub use smtp::SmtpPool;
