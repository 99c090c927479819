//! Cancellation tokens for background loops an action may end.

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tokens, one per background loop, that an action handler cancels once it
/// has fully handled an action.
///
/// Cancelling is one-way and idempotent: closing the set again is a no-op for
/// tokens that are already cancelled.
#[derive(Debug, Clone, Default)]
pub struct CloserSet {
    tokens: Vec<CancellationToken>,
}

impl CloserSet {
    pub fn new(tokens: impl IntoIterator<Item = CancellationToken>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Cancel every token. Returns how many were not cancelled before.
    pub fn close_all(&self) -> usize {
        let mut newly_closed = 0;
        for token in &self.tokens {
            if !token.is_cancelled() {
                token.cancel();
                newly_closed += 1;
            }
        }
        debug!(
            total = self.tokens.len(),
            newly_closed, "Closed background loops"
        );
        newly_closed
    }
}
