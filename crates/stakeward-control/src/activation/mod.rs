//! Validator activation.
//!
//! The [`ActivationEngine`] takes one identity through
//! `Unregistered → Imported → Submitted → Committed/Rejected →
//! PendingValidator → ActiveValidator`, checking on-chain membership before
//! every submission so an identity never has two transactions in flight.
//! The [`RegistrationCoordinator`] waits for the node to bootstrap and then
//! runs one engine task per identity under a shared run context.

mod coordinator;
mod engine;

pub use coordinator::{RegistrationCoordinator, RegistrationSummary};
pub use engine::ActivationEngine;
