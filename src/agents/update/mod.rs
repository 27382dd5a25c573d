// Update module - applies a change set with backup, conditional rebuild and rollback
//
// - UpdateResult / UpdateStage: outcome of one apply
// - Updater: the staged apply itself
// - UpdateInteraction: prompts for the interactive CLI mode
pub mod context;
pub mod interaction;
pub mod orchestrator;

pub use context::UpdateResult;
pub use interaction::UpdateInteraction;
pub use orchestrator::Updater;
