//! Wire-level types shared by the driver and transports.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | Close status codes and [`CloseInfo`] |
//! | `codec` | [`PayloadCodec`] and the JSON implementation |

// ============================================================================
// Submodules
// ============================================================================

/// Close status codes and closure details.
pub mod close;

/// Payload encoding.
pub mod codec;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::{CloseInfo, codes};
pub use codec::{JsonCodec, PayloadCodec};
