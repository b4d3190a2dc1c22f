use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::debug;

use crate::{
    address::{self, TargetDescriptor},
    client::{ClientConfig, ClientError, Session, SessionState, SymbolHandle},
    ctype::TypeRegistry,
};

/// Shares one [`Session`] per target between every user of that target
///
/// Sessions are created on first use and kept in the registry afterwards,
/// even when closed; a later registration on the same target reopens the
/// same session. Use [`ConnectionRegistry::evict_closed`] to forget closed
/// sessions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    config: ClientConfig,
    types: TypeRegistry,
    sessions: Mutex<HashMap<TargetDescriptor, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ClientConfig) -> Self {
        ConnectionRegistry {
            config,
            ..Default::default()
        }
    }

    /// Use custom decode plans for every symbol resolved through this registry
    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetDescriptor, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the session for a target, creating it if needed
    pub fn acquire(&self, target: &TargetDescriptor) -> Arc<Session> {
        match self.lock().entry(*target) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!("Creating session for {target}");
                entry
                    .insert(Arc::new(Session::new(*target, self.config.clone())))
                    .clone()
            }
        }
    }

    /// Release one registration of a symbol; the session closes on the last one
    pub fn release_symbol(&self, session: &Session, symbol_path: &str) -> bool {
        session.release_symbol(symbol_path)
    }

    /// Parse an address and open a handle for it
    pub async fn open_symbol(&self, address: &str) -> Result<SymbolHandle, ClientError> {
        let descriptor = address::parse(address)?;
        let session = self.acquire(&descriptor.target);
        SymbolHandle::open(
            session,
            &descriptor.symbol_path,
            descriptor.poll_rate,
            &self.types,
        )
        .await
    }

    /// Forget every closed session nobody else holds. Returns how many were
    /// removed.
    ///
    /// A closed session still held elsewhere stays, so that reopening it
    /// through the registry gives back that same session.
    pub fn evict_closed(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.state() == SessionState::Open || Arc::strong_count(session) > 1
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
