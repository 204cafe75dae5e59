//! Verification email waiter
//!
//! Races a mailbox polling loop against a deadline timer. Whichever resolves
//! first wins; the loser is cancelled by drop, so no poll is issued after the
//! deadline fires and no timer lingers after a match.

use std::time::Duration;
use regex::Regex;
use tracing::debug;

use super::{Mailbox, MailboxConnection, WaitError};

/// Waits for a confirmation email and extracts the verification link.
pub struct EmailWaiter<M: Mailbox> {
    mailbox: M,
    link_pattern: Regex,
    poll_interval: Duration,
}

impl<M: Mailbox> EmailWaiter<M> {
    /// `confirmation_domain` is the host the verification link must point at
    /// (an optional `www.` prefix is tolerated).
    pub fn new(mailbox: M, confirmation_domain: &str, poll_interval: Duration) -> Self {
        let pattern = format!(
            r#"(?i)https://(?:www\.)?{}/[^\s"'<>]*verify[^\s"'<>]*"#,
            regex::escape(confirmation_domain)
        );
        Self {
            mailbox,
            // Infallible: the only variable part is regex-escaped above
            link_pattern: Regex::new(&pattern).expect("link pattern"),
            poll_interval,
        }
    }

    /// Wait up to `max_wait` for a confirmation email addressed to
    /// `recipient`, returning the first verification link found in its body.
    ///
    /// The mailbox connection is released on every exit path. A matching
    /// message without a link is a terminal `LinkNotFound` failure, not a
    /// reason to keep polling.
    pub async fn await_confirmation_link(
        &self,
        recipient: &str,
        max_wait: Duration,
    ) -> Result<String, WaitError> {
        let mut conn = self.mailbox.connect().await?;

        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            // The deadline terminates the whole operation even if a poll is
            // in flight, so it is checked first on every wakeup.
            biased;
            _ = &mut deadline => Err(WaitError::Timeout { waited_secs: max_wait.as_secs() }),
            body = Self::poll_until_match(&mut conn, recipient, self.poll_interval) => body,
        };

        conn.close().await;

        let body = outcome?;
        self.extract_link(&body).ok_or(WaitError::LinkNotFound)
    }

    /// Re-issue the mailbox search on a fixed cadence until a message matches.
    async fn poll_until_match(
        conn: &mut M::Conn,
        recipient: &str,
        interval: Duration,
    ) -> Result<String, WaitError> {
        loop {
            if let Some(body) = conn.search_matching(recipient).await? {
                return Ok(body);
            }
            debug!("No confirmation email for {} yet, next poll in {:?}", recipient, interval);
            tokio::time::sleep(interval).await;
        }
    }

    /// Scan a message body for the verification link. The match stops at the
    /// first whitespace, quote, or angle bracket.
    fn extract_link(&self, body: &str) -> Option<String> {
        self.link_pattern.find(body).map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Mailbox whose connection matches on the nth search (or never).
    struct ScriptedMailbox {
        match_on: Option<usize>,
        body: String,
        fail_search: bool,
        searches: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedMailbox {
        fn new(match_on: Option<usize>, body: &str) -> Self {
            Self {
                match_on,
                body: body.to_string(),
                fail_search: false,
                searches: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct ScriptedConn {
        match_on: Option<usize>,
        body: String,
        fail_search: bool,
        searches: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Mailbox for ScriptedMailbox {
        type Conn = ScriptedConn;

        async fn connect(&self) -> Result<ScriptedConn, WaitError> {
            Ok(ScriptedConn {
                match_on: self.match_on,
                body: self.body.clone(),
                fail_search: self.fail_search,
                searches: self.searches.clone(),
                closed: self.closed.clone(),
            })
        }
    }

    #[async_trait]
    impl MailboxConnection for ScriptedConn {
        async fn search_matching(&mut self, _recipient: &str) -> Result<Option<String>, WaitError> {
            let n = self.searches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_search {
                return Err(WaitError::Search("mailbox unavailable".into()));
            }
            match self.match_on {
                Some(target) if n >= target => Ok(Some(self.body.clone())),
                _ => Ok(None),
            }
        }

        async fn close(self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn waiter(mailbox: ScriptedMailbox) -> EmailWaiter<ScriptedMailbox> {
        EmailWaiter::new(mailbox, "maplelist.ca", Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_stops_polling() {
        let mailbox = ScriptedMailbox::new(None, "");
        let searches = mailbox.searches.clone();
        let closed = mailbox.closed.clone();
        let waiter = waiter(mailbox);

        let result = waiter
            .await_confirmation_link("a@x.com", Duration::from_secs(30))
            .await;

        assert!(matches!(result, Err(WaitError::Timeout { waited_secs: 30 })));
        // Polls at t = 0, 5, 10, 15, 20, 25; the deadline wins at t = 30.
        let issued = searches.load(Ordering::SeqCst);
        assert_eq!(issued, 6);

        // No further searches after the deadline resolves.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(searches.load(Ordering::SeqCst), issued);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn match_before_deadline_returns_early() {
        let body = r#"<a href="https://www.maplelist.ca/account/verify?t=abc">Confirm</a>"#;
        let mailbox = ScriptedMailbox::new(Some(3), body);
        let searches = mailbox.searches.clone();
        let closed = mailbox.closed.clone();
        let waiter = waiter(mailbox);

        let start = tokio::time::Instant::now();
        let link = waiter
            .await_confirmation_link("a@x.com", Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(link, "https://www.maplelist.ca/account/verify?t=abc");
        assert_eq!(searches.load(Ordering::SeqCst), 3);
        // Third poll lands at t = 10; the remaining 110s are never waited.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn matching_email_without_link_is_terminal() {
        let mailbox = ScriptedMailbox::new(Some(1), "<p>Welcome aboard!</p>");
        let searches = mailbox.searches.clone();
        let closed = mailbox.closed.clone();
        let waiter = waiter(mailbox);

        let result = waiter
            .await_confirmation_link("a@x.com", Duration::from_secs(120))
            .await;

        assert!(matches!(result, Err(WaitError::LinkNotFound)));
        // One match, no resumed polling.
        assert_eq!(searches.load(Ordering::SeqCst), 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn search_error_propagates_and_releases_connection() {
        let mut mailbox = ScriptedMailbox::new(None, "");
        mailbox.fail_search = true;
        let closed = mailbox.closed.clone();
        let waiter = waiter(mailbox);

        let result = waiter
            .await_confirmation_link("a@x.com", Duration::from_secs(30))
            .await;

        assert!(matches!(result, Err(WaitError::Search(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn extraction_is_case_insensitive_and_stops_at_quotes() {
        let waiter = waiter(ScriptedMailbox::new(None, ""));

        let body = r#"Click: HTTPS://WWW.maplelist.ca/foo/verify?x=1" rest"#;
        assert_eq!(
            waiter.extract_link(body).as_deref(),
            Some("HTTPS://WWW.maplelist.ca/foo/verify?x=1")
        );

        // Idempotent: re-scanning an extracted link yields itself.
        let link = waiter.extract_link(body).unwrap();
        assert_eq!(waiter.extract_link(&link).as_deref(), Some(link.as_str()));

        // Angle brackets terminate the match too.
        let body = "<https://maplelist.ca/a/verify?t=9>";
        assert_eq!(
            waiter.extract_link(body).as_deref(),
            Some("https://maplelist.ca/a/verify?t=9")
        );

        // The marker must appear after the domain.
        assert_eq!(waiter.extract_link("https://maplelist.ca/welcome"), None);
        // Other hosts never match.
        assert_eq!(waiter.extract_link("https://elsewhere.ca/verify"), None);
    }
}
