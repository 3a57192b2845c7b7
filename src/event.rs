use crate::error::Error;

/// Lifecycle events the driver surfaces to its caller.
///
/// Delivery is synchronous and non-reentrant: an event handler runs to completion on the
/// same execution context as the operation that raised it, before that operation's own
/// future resolves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A card was just observed on the card-detect line.
    Inserted,
    /// The card-detect line just went high; the card is gone.
    Removed,
    /// Initialization completed and `read_block`/`write_block` may now be used.
    Ready,
    /// Initialization (or, in principle, a later fatal operation) failed.
    Error(Error),
}
