//! Node components: election, queue, scheduling, transfer, HTTP surface

pub mod coordination;
pub mod election;
pub mod http;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod transfer;
pub mod transition;

pub use coordination::{CoordinationStore, LeaseRecord, MemoryCoordinationStore};
pub use election::{LeaderElector, LeadershipState};
pub use queue::{Answer, PendingResponse, QueueStatus, SubmissionQueue};
pub use scheduler::DelayScheduler;
pub use server::{Collaborators, Node};
pub use transfer::{CommunicationType, Envelope, TransferClient, TransferRequest};
