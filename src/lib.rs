//! # veilq
//!
//! A privacy-preserving delayed submission queue for horizontally-scaled
//! survey fleets:
//! - records are held in memory and flushed at randomized times, in
//!   randomized amounts, so persistence can never be correlated with a
//!   submission event
//! - a single elected leader does all flushing; followers forward their
//!   batches over an authenticated transfer channel
//! - no participant identifier exists anywhere in the pipeline, and nothing
//!   with answer content is ever logged
//!
//! ## Architecture
//!
//! ```text
//!  submission path          ┌──────────────────────────┐
//!  (external) ───────────▶  │  Node (any instance)     │
//!                           │   ├─ LeaderElector ──────┼──▶ shared lease store
//!                           │   ├─ SubmissionQueue     │
//!                           │   ├─ DelayScheduler      │  leader only
//!                           │   └─ TransferClient ─────┼──▶ current leader
//!                           └───────────┬──────────────┘
//!                                       │ randomized flush cycles
//!                                       ▼
//!                             PersistenceGateway (external)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! VEILQ__INSTANCE__SECRET=fleet-secret veilq serve --port 8700
//! ```

pub mod common;
pub mod gateway;
pub mod node;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::{Collaborators, Node};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
