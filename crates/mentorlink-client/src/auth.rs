//! Credential source collaborator.

use std::sync::{Arc, RwLock};

/// Supplies the current user's bearer credential, if there is one.
pub trait CredentialSource: Send + Sync {
    /// Current bearer token. `None` when nobody is signed in.
    fn credential(&self) -> Option<String>;
}

impl<T: CredentialSource + ?Sized> CredentialSource for Arc<T> {
    fn credential(&self) -> Option<String> {
        (**self).credential()
    }
}

/// Credential that can be swapped at runtime, e.g. after a token refresh or
/// sign-out.
#[derive(Debug, Default)]
pub struct StaticCredential {
    token: RwLock<Option<String>>,
}

impl StaticCredential {
    /// Source holding `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())) }
    }

    /// Source with no credential.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Replace the token. `None` signs out.
    pub fn set(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_and_sign_out() {
        let source = StaticCredential::new("tok1");
        assert_eq!(source.credential().as_deref(), Some("tok1"));

        source.set(Some("tok2".into()));
        assert_eq!(source.credential().as_deref(), Some("tok2"));

        source.set(None);
        assert_eq!(source.credential(), None);
        assert_eq!(StaticCredential::signed_out().credential(), None);
    }
}
