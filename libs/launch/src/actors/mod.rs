//! Actor framework and controller actors.
//!
//! This module provides a lightweight actor framework tailored for the
//! launch controller's single-consumer mailbox semantics, plus the two
//! actors built on it.
//!
//! ## Design Principles
//!
//! - **One actor per job spec**: each controller owns the mutable state
//!   and side effects for exactly one job specification
//! - **Sequential mailboxes**: no two messages for the same controller are
//!   ever processed concurrently, so controller state needs no locks
//! - **No restarts**: a dead controller is dropped; recovery goes through
//!   the instance directory, not through respawn-with-state
//!
//! ## Actor Types
//!
//! - `LaunchController`: drives launching for a single job specification
//! - `LaunchFleet`: owns controllers and routes offers to subscribed ones

mod controller;
mod fleet;
mod framework;

pub use controller::{ControllerDeps, LaunchController, LauncherMessage};
pub use fleet::LaunchFleet;
pub use framework::{
    spawn, spawn_on, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message,
};
