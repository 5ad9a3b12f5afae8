//! Custom tracing layers for Indras nodes

use tracing::{Subscriber, span};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::{LookupSpan, SpanRef},
};

use crate::context::{PeerContextData, PeerContextGuard};

/// Layer that attaches the active peer context to new spans
///
/// Spans opened while a [`PeerContextGuard`] is held carry a
/// [`PeerContextExtension`]; child spans opened outside any guard inherit
/// their parent's.
pub struct PeerContextLayer;

impl PeerContextLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PeerContextLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct PeerContextExtension {
    pub data: PeerContextData,
}

impl<S> Layer<S> for PeerContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let data = PeerContextGuard::current().or_else(|| {
            span.parent()
                .and_then(|parent| peer_context(&parent))
        });
        if let Some(data) = data {
            span.extensions_mut().insert(PeerContextExtension { data });
        }
    }
}

/// The peer context recorded on a span, if any
pub fn peer_context<'a, R>(span: &SpanRef<'a, R>) -> Option<PeerContextData>
where
    R: LookupSpan<'a>,
{
    span.extensions()
        .get::<PeerContextExtension>()
        .map(|ext| ext.data.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use indras_core::Keypair;
    use tracing::Event;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    /// Records the peer attached to each event's span
    struct Probe(Arc<Mutex<Vec<Option<String>>>>);

    impl<S> Layer<S> for Probe
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
            let peer = ctx
                .event_span(event)
                .and_then(|span| peer_context(&span))
                .map(|data| data.peer_id);
            self.0.lock().unwrap().push(peer);
        }
    }

    #[test]
    fn test_spans_carry_peer_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry()
            .with(PeerContextLayer::new())
            .with(Probe(seen.clone()));
        let peer = Keypair::from_seed([9; 32]).peer_id();

        tracing::subscriber::with_default(subscriber, || {
            let outer = {
                let _guard = PeerContextGuard::new(&peer);
                tracing::info_span!("connect_chain")
            };
            let _entered = outer.enter();
            // Opened without a guard; inherits from the parent span
            tracing::info_span!("dial_attempt").in_scope(|| tracing::info!("dialing"));

            let unrelated = tracing::info_span!(parent: None, "detached");
            unrelated.in_scope(|| tracing::info!("no peer"));
        });

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![Some(peer.short_id()), None]);
    }
}
