//! Peer context injection for multi-node logging
//!
//! Thread-local storage for the local peer identity, so spans opened while a
//! guard is held can be attributed to one node among many in a process.

use std::cell::RefCell;

use indras_core::PeerId;
use uuid::Uuid;

/// Peer context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContextData {
    /// Short form of the local peer's identity
    pub peer_id: String,
    /// Unique instance ID for this node session
    pub instance_id: Uuid,
}

thread_local! {
    static PEER_CONTEXT: RefCell<Option<PeerContextData>> = const { RefCell::new(None) };
}

/// RAII guard for peer context
///
/// When this guard is created, it sets the peer context for the current thread.
/// When it's dropped, it restores the previous context (if any).
///
/// # Example
///
/// ```ignore
/// use indras_logging::context::PeerContextGuard;
///
/// let _guard = PeerContextGuard::new(&node.local_peer());
/// let span = tracing::info_span!("connect_chain");
/// ```
pub struct PeerContextGuard {
    previous: Option<PeerContextData>,
}

impl PeerContextGuard {
    /// Set the peer identity for spans opened in the current scope
    pub fn new(peer: &PeerId) -> Self {
        Self::with_instance_id(peer, Uuid::new_v4())
    }

    /// Create a guard with a specific instance ID
    ///
    /// Keeps one instance ID across the tasks of a single node.
    pub fn with_instance_id(peer: &PeerId, instance_id: Uuid) -> Self {
        let previous = PEER_CONTEXT.with(|ctx| ctx.borrow().clone());

        let new_ctx = PeerContextData {
            peer_id: peer.short_id(),
            instance_id,
        };

        PEER_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(new_ctx));

        Self { previous }
    }

    /// Get the current peer context (if any)
    pub fn current() -> Option<PeerContextData> {
        PEER_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Get the current peer ID (if set)
    pub fn current_peer_id() -> Option<String> {
        Self::current().map(|ctx| ctx.peer_id)
    }

    /// Get the current instance ID (if set)
    pub fn current_instance_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.instance_id)
    }
}

impl Drop for PeerContextGuard {
    fn drop(&mut self) {
        PEER_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Convenience macro to create a peer context scope
///
/// # Example
///
/// ```ignore
/// with_peer_context!(&peer_id, {
///     tracing::info!("Dialing");
/// });
/// ```
#[macro_export]
macro_rules! with_peer_context {
    ($peer:expr, $body:block) => {{
        let _guard = $crate::context::PeerContextGuard::new($peer);
        $body
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use indras_core::Keypair;

    #[test]
    fn test_peer_context_guard() {
        assert!(PeerContextGuard::current().is_none());

        let peer = Keypair::from_seed([1; 32]).peer_id();
        {
            let _guard = PeerContextGuard::new(&peer);
            let ctx = PeerContextGuard::current().unwrap();
            assert_eq!(ctx.peer_id, peer.short_id());
        }

        assert!(PeerContextGuard::current().is_none());
    }

    #[test]
    fn test_nested_contexts() {
        let a = Keypair::from_seed([1; 32]).peer_id();
        let b = Keypair::from_seed([2; 32]).peer_id();

        {
            let _guard_a = PeerContextGuard::new(&a);
            assert_eq!(PeerContextGuard::current_peer_id(), Some(a.short_id()));

            {
                let _guard_b = PeerContextGuard::new(&b);
                assert_eq!(PeerContextGuard::current_peer_id(), Some(b.short_id()));
            }

            // Restored after the inner guard drops
            assert_eq!(PeerContextGuard::current_peer_id(), Some(a.short_id()));
        }

        assert!(PeerContextGuard::current_peer_id().is_none());
    }

    #[test]
    fn test_with_instance_id() {
        let peer = Keypair::from_seed([3; 32]).peer_id();
        let instance_id = Uuid::new_v4();

        let _guard = PeerContextGuard::with_instance_id(&peer, instance_id);
        assert_eq!(PeerContextGuard::current_instance_id(), Some(instance_id));
    }

    #[test]
    fn test_macro_scope() {
        let peer = Keypair::from_seed([4; 32]).peer_id();
        let seen = crate::with_peer_context!(&peer, { PeerContextGuard::current_peer_id() });
        assert_eq!(seen, Some(peer.short_id()));
        assert!(PeerContextGuard::current().is_none());
    }
}
