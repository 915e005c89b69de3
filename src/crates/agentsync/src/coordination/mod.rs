//! Command coordination between front ends
//!
//! GUI and CLI sessions run commands through a [`CoreCoordinator`], which
//! logs activity, fans events out over the [`SyncBridge`] and flags
//! conflicting commands.

pub mod activity;
pub mod bridge;
pub mod command;
pub mod commands;
pub mod conflict;
pub mod coordinator;

pub use activity::{ActivityEntry, ActivityFilter, ActivityLogger, ActivityStats};
pub use bridge::{EventPayload, SyncBridge};
pub use command::{
    CommandCategory, CommandError, CommandHandler, CommandInfo, CommandOptions, CommandRegistry,
    CommandResult, Params,
};
pub use commands::{register_builtin, CommandContext};
pub use conflict::{
    ConflictFilter, ConflictInfo, ConflictResolver, ConflictType, Severity, Strategy,
};
pub use coordinator::{CoreCoordinator, COMMAND_EXECUTED, SYNC_CONFLICT};
