//! Confirmation-email access
//!
//! The waiter polls a mailbox for the marketplace's verification message and
//! extracts the confirmation link. The mailbox itself is behind a trait so the
//! race logic can be exercised without an IMAP server.

mod imap;
mod waiter;

pub use imap::{ImapMailbox, MailboxConfig};
pub use waiter::EmailWaiter;

use async_trait::async_trait;
use thiserror::Error;

/// Waiter failures. Display strings lead with the taxonomy name because they
/// end up verbatim in account notes.
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("MailConnectError: {0}")]
    Connect(String),

    #[error("MailSearchError: {0}")]
    Search(String),

    #[error("VerificationTimeout: no confirmation email within {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("LinkNotFound: confirmation email contained no verification link")]
    LinkNotFound,
}

/// A mailbox that can be opened for one waiter invocation.
///
/// Connections are never held across accounts: the waiter opens one per
/// invocation and releases it on every exit path.
#[async_trait]
pub trait Mailbox: Send + Sync {
    type Conn: MailboxConnection;

    async fn connect(&self) -> Result<Self::Conn, WaitError>;
}

/// One open mailbox connection.
#[async_trait]
pub trait MailboxConnection: Send {
    /// Run a single search pass for an unread confirmation message addressed
    /// to `recipient`. Returns the message body on a match, `None` otherwise.
    async fn search_matching(&mut self, recipient: &str) -> Result<Option<String>, WaitError>;

    /// Release the connection. Best-effort; called on every exit path.
    async fn close(self);
}
