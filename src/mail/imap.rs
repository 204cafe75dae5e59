//! IMAP-backed mailbox
//!
//! One fixed mailbox account receives every confirmation email. A connection
//! is opened per waiter invocation and never held across accounts.

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Mailbox, MailboxConnection, WaitError};

type TlsSession = async_imap::Session<async_native_tls::TlsStream<TcpStream>>;

/// Mailbox credentials and match criteria.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Sender domain the confirmation email must originate from
    pub sender_domain: String,
    /// Messages older than this are rejected as stale
    pub recency_secs: u64,
}

pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    type Conn = ImapConnection;

    async fn connect(&self) -> Result<ImapConnection, WaitError> {
        let cfg = &self.config;

        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .map_err(|e| WaitError::Connect(format!("{}:{}: {}", cfg.host, cfg.port, e)))?;

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(cfg.host.as_str(), tcp)
            .await
            .map_err(|e| WaitError::Connect(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&cfg.user, &cfg.password)
            .await
            .map_err(|(e, _)| WaitError::Connect(e.to_string()))?;

        session
            .select("INBOX")
            .await
            .map_err(|e| WaitError::Search(e.to_string()))?;

        debug!("IMAP session opened for {} on {}", cfg.user, cfg.host);

        Ok(ImapConnection {
            session,
            sender_domain: cfg.sender_domain.clone(),
            recency_secs: cfg.recency_secs,
        })
    }
}

pub struct ImapConnection {
    session: TlsSession,
    sender_domain: String,
    recency_secs: u64,
}

#[async_trait]
impl MailboxConnection for ImapConnection {
    async fn search_matching(&mut self, recipient: &str) -> Result<Option<String>, WaitError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.recency_secs as i64);

        // IMAP SINCE is day-granular; it bounds the candidate set server-side
        // and the real recency window is enforced on INTERNALDATE below.
        let query = format!(
            r#"UNSEEN TO "{}" FROM "{}" SINCE {}"#,
            recipient,
            self.sender_domain,
            cutoff.format("%d-%b-%Y")
        );

        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| WaitError::Search(e.to_string()))?;

        if uids.is_empty() {
            return Ok(None);
        }

        let mut ordered: Vec<u32> = uids.into_iter().collect();
        ordered.sort_unstable();
        let set = ordered
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut found = None;
        {
            let mut fetches = self
                .session
                .uid_fetch(&set, "(RFC822 INTERNALDATE)")
                .await
                .map_err(|e| WaitError::Search(e.to_string()))?;

            while let Some(msg) = fetches
                .try_next()
                .await
                .map_err(|e| WaitError::Search(e.to_string()))?
            {
                if let Some(received) = msg.internal_date() {
                    if received.with_timezone(&Utc) < cutoff {
                        continue;
                    }
                }
                if let Some(raw) = msg.body() {
                    // A matched message with an unreadable body still counts
                    // as the match; the waiter then reports LinkNotFound.
                    found = Some(message_html(raw).unwrap_or_default());
                    break;
                }
            }
        }

        Ok(found)
    }

    async fn close(mut self) {
        let _ = self.session.logout().await;
    }
}

/// Pull the HTML part out of a raw message, falling back to plain text.
fn message_html(raw: &[u8]) -> Option<String> {
    let mail = mailparse::parse_mail(raw).ok()?;
    part_with_type(&mail, "text/html").or_else(|| part_with_type(&mail, "text/plain"))
}

fn part_with_type(mail: &mailparse::ParsedMail, mimetype: &str) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return mail.get_body().ok();
    }
    mail.subparts.iter().find_map(|p| part_with_type(p, mimetype))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_part_is_preferred_over_text() {
        let raw = concat!(
            "From: no-reply@maplelist.ca\r\n",
            "To: a@x.com\r\n",
            "Subject: Confirm your account\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"sep\"\r\n",
            "\r\n",
            "--sep\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Visit https://maplelist.ca/plain/verify?t=1\r\n",
            "--sep\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<a href=\"https://maplelist.ca/html/verify?t=2\">Confirm</a>\r\n",
            "--sep--\r\n",
        );

        let body = message_html(raw.as_bytes()).unwrap();
        assert!(body.contains("/html/verify?t=2"));
    }

    #[test]
    fn plain_text_fallback_when_no_html_part() {
        let raw = concat!(
            "From: no-reply@maplelist.ca\r\n",
            "To: a@x.com\r\n",
            "Subject: Confirm your account\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Visit https://maplelist.ca/a/verify?t=1\r\n",
        );

        let body = message_html(raw.as_bytes()).unwrap();
        assert!(body.contains("/a/verify?t=1"));
    }
}
