use std::sync::{Arc, Weak};

use crate::error::{MuxwireError, Result};
use crate::handler::{ConnectionHandler, RemoteClient};

/// Connection an unmarshaller resolves client references against.
#[derive(Debug, Clone, Default)]
pub struct UnmarshalContext {
    handler: Weak<ConnectionHandler>,
}

impl UnmarshalContext {
    pub fn new(handler: &Arc<ConnectionHandler>) -> Self {
        Self {
            handler: Arc::downgrade(handler),
        }
    }

    /// Context with no connection; client references fail to resolve.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Live client for a reference received on this connection.
    pub fn resolve_client(&self, id: i32) -> Result<RemoteClient> {
        let handler = self.handler.upgrade().ok_or_else(|| {
            MuxwireError::Marshalling(format!(
                "Client reference {} outside of a connection",
                id
            ))
        })?;
        handler.remote_client(id)
    }
}
