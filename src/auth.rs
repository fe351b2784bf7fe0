mod token;

use std::collections::HashMap;
use std::sync::RwLock;

pub use token::Token;

/// Key under which the Azure DevOps personal access token is stored.
pub const PAT_KEY: &str = "PAT_TOKEN";

/// Name/value credential storage read on every outbound request.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Token>;

    fn set(&self, key: &str, value: Token);
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, Token>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<Token> {
        let values = self.values.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        values.get(key).filter(|t| !t.is_empty()).cloned()
    }

    fn set(&self, key: &str, value: Token) {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        values.insert(key.to_string(), value);
    }
}
