//! Per-connection session state.

use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use warden_core::types::SubscriptionId;

/// Constant-time bearer token comparison via BLAKE3 digests.
/// Hashing normalizes lengths so `ct_eq` always compares 32 bytes.
#[must_use]
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = blake3::hash(a.as_bytes());
    let hb = blake3::hash(b.as_bytes());
    ha.as_bytes().ct_eq(hb.as_bytes()).into()
}

/// State for one client connection. Owned by the connection task, so
/// no interior locking: messages from one client are processed in
/// arrival order.
pub struct Session {
    /// Server-assigned client id.
    pub client_id: String,
    /// Whether the auth gate has passed.
    pub authenticated: bool,
    /// Channel patterns this client subscribed to.
    pub channels: Vec<String>,
    /// Bus subscriptions to drop on disconnect.
    pub bus_subscriptions: Vec<SubscriptionId>,
    /// Cancelled on disconnect; outstanding work observes it.
    pub cancel: CancellationToken,
    /// Peer address, for audit entries.
    pub remote_addr: Option<String>,
}

impl Session {
    /// Fresh unauthenticated session.
    #[must_use]
    pub fn new(remote_addr: Option<String>) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            authenticated: false,
            channels: Vec::new(),
            bus_subscriptions: Vec::new(),
            cancel: CancellationToken::new(),
            remote_addr,
        }
    }

    /// Check `provided` against the accepted token list.
    #[must_use]
    pub fn authenticate(&mut self, provided: &str, accepted: &[String]) -> bool {
        // Walk the whole list regardless of where a match lands.
        let mut ok = false;
        for token in accepted {
            ok |= token_eq(provided, token);
        }
        self.authenticated = ok;
        ok
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("authenticated", &self.authenticated)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_eq() {
        assert!(token_eq("secret-token", "secret-token"));
        assert!(!token_eq("secret-token", "secret-token2"));
        assert!(!token_eq("", "x"));
    }

    #[test]
    fn test_authenticate_against_list() {
        let accepted = vec!["tok-a".to_string(), "tok-b".to_string()];
        let mut session = Session::new(None);
        assert!(!session.authenticated);

        assert!(session.authenticate("tok-b", &accepted));
        assert!(session.authenticated);

        let mut session = Session::new(None);
        assert!(!session.authenticate("tok-c", &accepted));
        assert!(!session.authenticated);
        assert!(!session.authenticate("anything", &[]));
    }
}
