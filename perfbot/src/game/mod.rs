//! Profiled game supervision.

mod session;

pub use session::{GameSession, GameStopHandle};
