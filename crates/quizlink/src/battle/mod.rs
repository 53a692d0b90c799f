// Match-level state: phase machine, scoreboard, deadline, submissions and
// snapshot recovery.

pub mod deadline;
pub mod phase;
pub mod scoreboard;
pub mod snapshot;
pub mod submission;
