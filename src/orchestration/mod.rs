pub mod pipeline;
pub mod router;

pub use pipeline::{PipelineOrchestrator, PipelineOutcome, PipelineParams, PipelineState, StateTracker};
pub use router::{DetectionBackend, Origin, PendingEntry, RemoteReply, RequestRouter};
