use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{MixerError, Result};

/// Gate in front of request creation.
#[async_trait]
pub trait AccountChecker: Send + Sync {
    async fn account_exists(&self, account_id: &str) -> Result<()>;
}

/// Static allow-list. An empty list admits any non-empty account id.
pub struct AllowListChecker {
    allowed: HashSet<String>,
}

impl AllowListChecker {
    pub fn new<I: IntoIterator<Item = String>>(accounts: I) -> Self {
        Self {
            allowed: accounts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccountChecker for AllowListChecker {
    async fn account_exists(&self, account_id: &str) -> Result<()> {
        if account_id.trim().is_empty() {
            return Err(MixerError::AccountNotFound("<empty>".into()));
        }
        if !self.allowed.is_empty() && !self.allowed.contains(account_id) {
            return Err(MixerError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_list_admits_any_account() {
        let checker = AllowListChecker::new(Vec::new());
        assert!(checker.account_exists("anyone").await.is_ok());
        assert!(checker.account_exists("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_allow_list() {
        let checker = AllowListChecker::new(vec!["alice".to_string()]);
        assert!(checker.account_exists("alice").await.is_ok());
        assert!(matches!(
            checker.account_exists("mallory").await,
            Err(MixerError::AccountNotFound(_))
        ));
    }
}
