//! Typed in-memory storage for a participant's intermediate protocol state.
//!
//! Values are keyed by a marker type implementing [`TypeTag`] plus the peer
//! they concern, so each state machine declares its storage layout as a set
//! of zero-sized tags and retrieval is statically typed.

// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{InternalError, Result},
    protocol::PeerId,
};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
};
use tracing::error;

/// Marker trait naming one kind of stored value.
pub(crate) trait TypeTag: 'static {
    /// The type of the stored values.
    type Value: Send + Sync;
}

/// Typed storage, keyed by value kind and peer.
#[derive(Default)]
pub(crate) struct LocalStorage {
    storage: HashMap<(TypeId, PeerId), Box<dyn Any + Send + Sync>>,
}

// The stored values are type-erased (and may be secret); only the entry
// count is ever shown.
impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("entries", &self.storage.len())
            .finish()
    }
}

impl LocalStorage {
    /// Store a value, overwriting any previous value under the same key.
    pub(crate) fn store<T: TypeTag>(&mut self, peer: PeerId, value: T::Value) {
        let _ = self
            .storage
            .insert((TypeId::of::<T>(), peer), Box::new(value));
    }

    /// Store a value, failing if one is already present under the same key.
    ///
    /// Used for messages a peer must send exactly once; a duplicate is a
    /// protocol error attributed to that peer.
    pub(crate) fn store_once<T: TypeTag>(&mut self, peer: PeerId, value: T::Value) -> Result<()> {
        if self.contains::<T>(peer) {
            error!("duplicate value stored for peer {}", peer);
            return Err(InternalError::ProtocolError(Some(peer)));
        }
        self.store::<T>(peer, value);
        Ok(())
    }

    /// Borrow the value stored for a peer.
    pub(crate) fn retrieve<T: TypeTag>(&self, peer: PeerId) -> Result<&T::Value> {
        self.storage
            .get(&(TypeId::of::<T>(), peer))
            .and_then(|boxed| boxed.downcast_ref())
            .ok_or_else(|| {
                error!("expected stored value for peer {} was missing", peer);
                InternalError::InternalInvariantFailed
            })
    }

    /// Remove and return the value stored for a peer.
    pub(crate) fn remove<T: TypeTag>(&mut self, peer: PeerId) -> Result<T::Value> {
        self.storage
            .remove(&(TypeId::of::<T>(), peer))
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
            .ok_or_else(|| {
                error!("expected stored value for peer {} was missing", peer);
                InternalError::InternalInvariantFailed
            })
    }

    /// Whether a value is stored for a peer.
    pub(crate) fn contains<T: TypeTag>(&self, peer: PeerId) -> bool {
        self.storage.contains_key(&(TypeId::of::<T>(), peer))
    }

    /// Whether a value is stored for every one of the given peers.
    pub(crate) fn contains_for_all_ids<T: TypeTag>(&self, peers: &[PeerId]) -> bool {
        peers.iter().all(|peer| self.contains::<T>(*peer))
    }
}
