use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

pub(crate) const NONCE_LEN: usize = 12;
const PREFIX_LEN: usize = 4;

/// `[prefix:4][counter:8 BE]`. The prefix is drawn once per process, the
/// counter never repeats while the process lives.
pub(crate) struct HybridNonce {
    prefix: [u8; PREFIX_LEN],
    counter: AtomicU64,
}

impl HybridNonce {
    fn with_prefix(prefix: [u8; PREFIX_LEN]) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Next unique nonce, or `None` once the counter space is exhausted.
    pub(crate) fn next(&self) -> Option<[u8; NONCE_LEN]> {
        let count = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .ok()?;
        let mut out = [0u8; NONCE_LEN];
        out[..PREFIX_LEN].copy_from_slice(&self.prefix);
        out[PREFIX_LEN..].copy_from_slice(&count.to_be_bytes());
        Some(out)
    }
}

static PROCESS_NONCE: LazyLock<HybridNonce> =
    LazyLock::new(|| HybridNonce::with_prefix(rand::random()));

pub(crate) fn next_nonce() -> Option<[u8; NONCE_LEN]> {
    PROCESS_NONCE.next()
}
