/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;

/// Basic credential gate for the client-facing leg.
///
/// A failed check answers 407 with the configured realm and keeps the
/// connection open for a retry.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;

    fn realm(&self) -> &str {
        "proxy"
    }
}

/// In-memory username/password table.
pub struct StaticUserAuthenticator {
    realm: String,
    users: HashMap<String, String>,
}

impl StaticUserAuthenticator {
    pub fn new(realm: impl Into<String>) -> Self {
        StaticUserAuthenticator {
            realm: realm.into(),
            users: HashMap::new(),
        }
    }

    pub fn add_user(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }
}

impl ProxyAuthenticator for StaticUserAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|p| p == password)
            .unwrap_or(false)
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_users() {
        let mut auth = StaticUserAuthenticator::new("test-realm");
        auth.add_user("alice", "open-sesame");

        assert!(auth.authenticate("alice", "open-sesame"));
        assert!(!auth.authenticate("alice", "wrong"));
        assert!(!auth.authenticate("bob", "open-sesame"));
        assert_eq!(auth.realm(), "test-realm");
    }
}
