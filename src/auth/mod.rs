//! SASL-style authentication mechanisms.
//!
//! A mechanism is a pair of evaluators exchanging opaque byte strings:
//! the server issues challenges, the client answers them, and both sides
//! report when they consider the exchange complete.
//!
//! ```text
//! client                         server
//!   AUTH_REQUEST(name)    ──►      initial_challenge()
//!                         ◄──    AUTH_CHALLENGE(bytes)
//!   evaluate_challenge()
//!   AUTH_RESPONSE(bytes)  ──►      evaluate_response()
//!                         ◄──    AUTH_COMPLETE(bytes) | AUTH_CHALLENGE(bytes)
//! ```
//!
//! Built-in: [`Anonymous`] and [`Plain`].

mod anonymous;
mod plain;

pub use anonymous::Anonymous;
pub use plain::{Plain, Verifier};

use std::sync::Arc;

use crate::error::Result;

/// Client half of a mechanism.
pub trait ClientMechanism: Send {
    /// Answer a challenge (or the final AUTH_COMPLETE payload).
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// True once the client needs no further challenges.
    fn is_complete(&self) -> bool;
}

/// Server half of a mechanism.
pub trait ServerMechanism: Send {
    /// Challenge sent right after AUTH_REQUEST.
    fn initial_challenge(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Check a response and produce the next challenge or final data.
    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>>;

    fn is_complete(&self) -> bool;

    /// Identity established by a completed exchange.
    fn authorized_id(&self) -> Option<String>;
}

/// Named factory for mechanism evaluators.
pub trait MechanismProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// `None` if this provider cannot act as a client.
    fn client_mechanism(&self) -> Option<Box<dyn ClientMechanism>>;

    /// `None` if this provider cannot act as a server.
    fn server_mechanism(&self) -> Option<Box<dyn ServerMechanism>>;
}

/// Mechanisms available to an endpoint, in registration order.
#[derive(Clone, Default)]
pub struct MechanismRegistry {
    providers: Vec<Arc<dyn MechanismProvider>>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing one with the same name.
    pub fn register(&mut self, provider: Arc<dyn MechanismProvider>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn MechanismProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Names a server offers, optionally restricted to `allowed`.
    pub fn server_offer(&self, allowed: &[String]) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| allowed.is_empty() || allowed.iter().any(|a| a == p.name()))
            .filter(|p| p.server_mechanism().is_some())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Pick the mechanism a client uses from the server's offer.
    ///
    /// With a non-empty `preference`, the first preferred name that is
    /// offered wins; otherwise the first offered name this side supports.
    pub fn select_client(
        &self,
        offered: &[String],
        preference: &[String],
    ) -> Option<(String, Box<dyn ClientMechanism>)> {
        let candidates: Vec<&String> = if preference.is_empty() {
            offered.iter().collect()
        } else {
            preference.iter().filter(|p| offered.contains(*p)).collect()
        };
        candidates.into_iter().find_map(|name| {
            self.get(name)
                .and_then(|p| p.client_mechanism())
                .map(|m| (name.clone(), m))
        })
    }
}

impl std::fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.iter().map(|p| p.name())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MechanismRegistry {
        let mut registry = MechanismRegistry::new();
        registry.register(Arc::new(Anonymous::new()));
        registry.register(Arc::new(Plain::client("authz", "user", "secret")));
        registry
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_supported_offer_wins() {
        let offered = names(&["GSSAPI", "PLAIN", "ANONYMOUS"]);
        let (name, _) = registry().select_client(&offered, &[]).unwrap();
        assert_eq!(name, "PLAIN");
    }

    #[test]
    fn test_preference_order_honoured() {
        let offered = names(&["PLAIN", "ANONYMOUS"]);
        let (name, _) = registry()
            .select_client(&offered, &names(&["ANONYMOUS", "PLAIN"]))
            .unwrap();
        assert_eq!(name, "ANONYMOUS");
    }

    #[test]
    fn test_nothing_in_common() {
        assert!(registry()
            .select_client(&names(&["GSSAPI"]), &[])
            .is_none());
        assert!(registry().select_client(&[], &[]).is_none());
    }

    #[test]
    fn test_server_offer_skips_client_only_providers() {
        // Plain::client has no verifier, so it cannot serve.
        assert_eq!(registry().server_offer(&[]), ["ANONYMOUS"]);
    }

    #[test]
    fn test_server_offer_restricted() {
        let mut registry = registry();
        registry.register(Arc::new(Plain::server(Arc::new(|_: &str, _: &str| true))));
        assert_eq!(registry.server_offer(&[]), ["ANONYMOUS", "PLAIN"]);
        assert_eq!(registry.server_offer(&names(&["PLAIN"])), ["PLAIN"]);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Arc::new(Anonymous::with_trace("again")));
        assert_eq!(registry.names(), ["PLAIN", "ANONYMOUS"]);
    }
}
