//! Filter resolution and fan-out delivery.

use tether_core::filter::MessageFilter;
use tracing::{debug, warn};

use crate::registry::{ConnectionEntry, ConnectionRegistry, Frame};

/// Targets of `filter`, in registry order.
pub fn resolve<'a>(registry: &'a ConnectionRegistry, filter: &MessageFilter) -> Vec<&'a ConnectionEntry> {
    registry.iter().filter(|e| filter.matches(&e.meta)).collect()
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    pub targeted: usize,
    pub delivered: usize,
    /// Entries removed from the registry because their write failed.
    pub evicted: Vec<ConnectionEntry>,
}

/// Write `frame` to every connection selected by `filter`.
///
/// A failed write never stops delivery to the remaining targets. The failed
/// connection is dropped from the registry and its socket torn down.
pub fn deliver(registry: &mut ConnectionRegistry, filter: &MessageFilter, frame: &Frame) -> Delivery {
    let mut delivery = Delivery::default();
    let mut failed = Vec::new();

    for entry in resolve(registry, filter) {
        delivery.targeted += 1;
        match entry.socket.send(frame.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                warn!(
                    connection_id = %entry.meta.connection_id,
                    error = %e,
                    "broadcast write failed, evicting connection"
                );
                failed.push(entry.meta.connection_id.clone());
            }
        }
    }

    for id in failed {
        if let Some(entry) = registry.remove(&id) {
            entry.socket.cancellation().cancel();
            delivery.evicted.push(entry);
        }
    }

    debug!(
        filter = filter.kind(),
        targeted = delivery.targeted,
        delivered = delivery.delivered,
        "broadcast delivered"
    );
    delivery
}
