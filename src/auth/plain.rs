use std::fmt;
use std::sync::Arc;

use super::{ClientMechanism, MechanismProvider, ServerMechanism};
use crate::error::{MuxwireError, Result};

/// Checks a user name and password.
pub type Verifier = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Clone)]
struct Credentials {
    authzid: String,
    user: String,
    password: String,
}

/// `PLAIN`: `authzid NUL user NUL password` in a single response.
///
/// A provider built with [`Plain::client`] can only authenticate outwards;
/// one built with [`Plain::server`] can only verify.
#[derive(Clone, Default)]
pub struct Plain {
    credentials: Option<Credentials>,
    verifier: Option<Verifier>,
}

impl Plain {
    pub fn client(
        authzid: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            credentials: Some(Credentials {
                authzid: authzid.into(),
                user: user.into(),
                password: password.into(),
            }),
            verifier: None,
        }
    }

    pub fn server(verifier: Verifier) -> Self {
        Self {
            credentials: None,
            verifier: Some(verifier),
        }
    }
}

impl fmt::Debug for Plain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plain")
            .field("client", &self.credentials.is_some())
            .field("server", &self.verifier.is_some())
            .finish()
    }
}

impl MechanismProvider for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn client_mechanism(&self) -> Option<Box<dyn ClientMechanism>> {
        let credentials = self.credentials.clone()?;
        Some(Box::new(PlainClient {
            credentials,
            complete: false,
        }))
    }

    fn server_mechanism(&self) -> Option<Box<dyn ServerMechanism>> {
        let verifier = self.verifier.clone()?;
        Some(Box::new(PlainServer {
            verifier,
            authorized: None,
        }))
    }
}

struct PlainClient {
    credentials: Credentials,
    complete: bool,
}

impl ClientMechanism for PlainClient {
    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Ok(Vec::new());
        }
        let c = &self.credentials;
        let mut out = Vec::with_capacity(c.authzid.len() + c.user.len() + c.password.len() + 2);
        out.extend_from_slice(c.authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(c.user.as_bytes());
        out.push(0);
        out.extend_from_slice(c.password.as_bytes());
        self.complete = true;
        Ok(out)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

struct PlainServer {
    verifier: Verifier,
    authorized: Option<String>,
}

impl ServerMechanism for PlainServer {
    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(response)
            .map_err(|_| MuxwireError::Authentication("PLAIN response is not UTF-8".to_string()))?;
        let mut parts = text.split('\0');
        let (authzid, user, password) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(a), Some(u), Some(p), None) => (a, u, p),
            _ => {
                return Err(MuxwireError::Authentication(
                    "PLAIN response must have three fields".to_string(),
                ))
            }
        };
        if user.is_empty() || !(self.verifier)(user, password) {
            return Err(MuxwireError::Authentication("invalid credentials".to_string()));
        }
        let authorized = if authzid.is_empty() { user } else { authzid };
        self.authorized = Some(authorized.to_string());
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        self.authorized.is_some()
    }

    fn authorized_id(&self) -> Option<String> {
        self.authorized.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Box<dyn ServerMechanism> {
        Plain::server(Arc::new(|user: &str, password: &str| {
            user == "alice" && password == "wonderland"
        }))
        .server_mechanism()
        .unwrap()
    }

    #[test]
    fn test_response_layout() {
        let mut client = Plain::client("", "alice", "wonderland")
            .client_mechanism()
            .unwrap();
        assert_eq!(client.evaluate_challenge(b"").unwrap(), b"\0alice\0wonderland");
        assert!(client.is_complete());
    }

    #[test]
    fn test_authzid_defaults_to_user() {
        let mut server = server();
        server.evaluate_response(b"\0alice\0wonderland").unwrap();
        assert!(server.is_complete());
        assert_eq!(server.authorized_id().as_deref(), Some("alice"));
    }

    #[test]
    fn test_explicit_authzid() {
        let mut server = server();
        server.evaluate_response(b"admin\0alice\0wonderland").unwrap();
        assert_eq!(server.authorized_id().as_deref(), Some("admin"));
    }

    #[test]
    fn test_bad_password() {
        let mut server = server();
        let err = server.evaluate_response(b"\0alice\0guess").unwrap_err();
        assert!(matches!(err, MuxwireError::Authentication(_)));
        assert!(!server.is_complete());
    }

    #[test]
    fn test_malformed_response() {
        assert!(server().evaluate_response(b"alice").is_err());
        assert!(server().evaluate_response(b"a\0b\0c\0d").is_err());
    }

    #[test]
    fn test_one_sided_providers() {
        assert!(Plain::client("", "u", "p").server_mechanism().is_none());
        assert!(Plain::server(Arc::new(|_: &str, _: &str| true))
            .client_mechanism()
            .is_none());
    }
}
