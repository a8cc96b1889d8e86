//! Rank transition kernel.
//!
//! Every rank change of a participant goes through [`step`]; invariants are checked on the
//! way in and on the way out, so a protection counter can never exceed its rank's allowance.

pub mod command;
pub mod invariants;
pub mod state;
pub mod step;
pub mod types;


pub use command::Command;
pub use invariants::check_invariants;
pub use state::State;
pub use step::{step, Effects};
pub use types::*;
