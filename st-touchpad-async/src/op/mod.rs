//! Wire-level building blocks: command opcodes, record layouts and the pure
//! logic operating on them.

pub mod cmd;
pub mod event;
pub mod heatmap;
pub mod info;
pub mod report;
pub mod state;

pub use cmd::*;
pub use event::*;
pub use heatmap::*;
pub use info::*;
pub use report::*;
pub use state::*;
