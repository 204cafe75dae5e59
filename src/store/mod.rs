//! Account store client
//!
//! The account records live in a remote HTTP store. The engine only reads
//! eligible accounts and writes terminal status plus notes; everything else
//! about the records is the store's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Account record under provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Ready,
    Verified,
    Failed,
}

/// Terminal status write-back for one attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPatch {
    pub status: AccountStatus,
    pub notes: String,
}

impl AccountPatch {
    pub fn verified(notes: impl Into<String>) -> Self {
        Self { status: AccountStatus::Verified, notes: notes.into() }
    }

    pub fn failed(notes: impl Into<String>) -> Self {
        Self { status: AccountStatus::Failed, notes: notes.into() }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {0}")]
    Api(reqwest::StatusCode),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch up to `limit` accounts eligible for provisioning (`ready` only).
    async fn list_eligible(&self, limit: usize) -> Result<Vec<Account>, StoreError>;

    /// Write a terminal status. Best-effort: callers log failures and move on.
    async fn patch(&self, account_id: &str, patch: AccountPatch) -> Result<(), StoreError>;
}

/// HTTP client against the account store API.
pub struct HttpAccountStore {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AccountListResponse {
    #[serde(default)]
    accounts: Vec<Account>,
}

impl HttpAccountStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AccountStore for HttpAccountStore {
    async fn list_eligible(&self, limit: usize) -> Result<Vec<Account>, StoreError> {
        let url = format!("{}/api/accounts?status=ready", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(StoreError::Api(resp.status()));
        }

        let list: AccountListResponse = resp.json().await?;
        let mut accounts = list.accounts;
        // The store filters by status already; re-check so a stale or
        // misbehaving response can never widen eligibility.
        accounts.retain(|a| a.status == AccountStatus::Ready);
        accounts.truncate(limit);

        debug!("Store returned {} eligible accounts (limit {})", accounts.len(), limit);
        Ok(accounts)
    }

    async fn patch(&self, account_id: &str, patch: AccountPatch) -> Result<(), StoreError> {
        let url = format!("{}/api/accounts/{}", self.base_url, account_id);
        let resp = self.client.patch(&url).json(&patch).send().await?;

        if !resp.status().is_success() {
            return Err(StoreError::Api(resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_status_uses_lowercase_wire_form() {
        let account: Account = serde_json::from_str(
            r#"{"id":"7","email":"a@x.com","password":"pw","displayName":"Ann","status":"ready"}"#,
        )
        .unwrap();
        assert_eq!(account.status, AccountStatus::Ready);
        assert_eq!(account.display_name, "Ann");
        assert!(account.notes.is_none());

        let patch = AccountPatch::verified("location:Toronto");
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["status"], "verified");
        assert_eq!(json["notes"], "location:Toronto");
    }
}
