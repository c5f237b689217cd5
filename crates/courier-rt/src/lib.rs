//! ---
//! courier_section: "04-scheduling"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Cooperative scheduling of message-driven components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Cooperative scheduling for courier components.

pub mod scheduling;

pub use scheduling::{MicroScheduler, MicroThread, StepOutcome, ThreadState, Tick, Ticks};
