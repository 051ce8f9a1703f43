//! Streaming platform REST and OAuth endpoints.

pub mod client;
pub mod error;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HelixClient, PlatformApi};
pub use error::PlatformError;
pub use types::{
    ConduitInfo, PlatformUser, SubscriptionInfo, SubscriptionRequest, TimeoutParams, TokenGrant,
    TokenInfo,
};

use regex::Regex;
use std::sync::LazyLock;

static LOGIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_]{1,25}$").unwrap()
});

/// Whether `login` fits the platform's username grammar.
pub fn is_valid_login(login: &str) -> bool {
    LOGIN_RE.is_match(login)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_grammar() {
        assert!(is_valid_login("alice"));
        assert!(is_valid_login("Some_User_42"));
        assert!(is_valid_login("abc"));
        assert!(!is_valid_login(""));
        assert!(!is_valid_login("has space"));
        assert!(!is_valid_login("dash-name"));
        assert!(!is_valid_login("../etc"));
        assert!(!is_valid_login(&"a".repeat(26)));
    }
}
