use super::{ClientMechanism, MechanismProvider, ServerMechanism};
use crate::error::{MuxwireError, Result};

/// Identity reported for anonymous peers.
pub const ANONYMOUS_ID: &str = "anonymous";

/// `ANONYMOUS`: no credentials, optional trace token.
#[derive(Debug, Clone, Default)]
pub struct Anonymous {
    trace: Option<String>,
}

impl Anonymous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `trace` to the server when acting as a client.
    pub fn with_trace(trace: impl Into<String>) -> Self {
        Self {
            trace: Some(trace.into()),
        }
    }
}

impl MechanismProvider for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn client_mechanism(&self) -> Option<Box<dyn ClientMechanism>> {
        Some(Box::new(AnonymousClient {
            trace: self.trace.clone(),
            complete: false,
        }))
    }

    fn server_mechanism(&self) -> Option<Box<dyn ServerMechanism>> {
        Some(Box::new(AnonymousServer {
            trace: None,
            complete: false,
        }))
    }
}

struct AnonymousClient {
    trace: Option<String>,
    complete: bool,
}

impl ClientMechanism for AnonymousClient {
    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.complete = true;
        Ok(self.trace.clone().map(String::into_bytes).unwrap_or_default())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

struct AnonymousServer {
    trace: Option<String>,
    complete: bool,
}

impl ServerMechanism for AnonymousServer {
    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Err(MuxwireError::Authentication(
                "ANONYMOUS exchange already complete".to_string(),
            ));
        }
        if !response.is_empty() {
            let trace = std::str::from_utf8(response).map_err(|_| {
                MuxwireError::Authentication("ANONYMOUS trace is not UTF-8".to_string())
            })?;
            self.trace = Some(trace.to_string());
        }
        self.complete = true;
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn authorized_id(&self) -> Option<String> {
        self.complete.then(|| ANONYMOUS_ID.to_string())
    }
}
