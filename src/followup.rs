//! Follow-up tracking: after the bot replies in a conversation, keep watching
//! it for a bounded window and let a judgment model decide whether to speak
//! again.

mod buffer;
mod gateway;
mod registry;
mod session;
mod task;
mod transport;

pub use buffer::ConversationBuffer;
pub use gateway::{
    DecisionGateway, DecisionRequest, DecisionVerdict, OpenRouterGateway, parse_verdict,
    render_context, render_prompt,
};
pub use registry::{StartOutcome, TerminationReport, TrackerRegistry};
pub use session::{FollowUpSession, SessionState, TerminationReason, Transition};
pub use transport::{DiscordTransport, Transport};
