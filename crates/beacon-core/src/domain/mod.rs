//! Domain entities for Beacon.
//!
//! Pure membership logic with no sockets, tasks, or clocks.  The async
//! runtime in `beacon-node` feeds it hellos and timer ticks and carries out
//! the [`membership::Outcome`] it returns.

pub mod membership;
pub mod node;
