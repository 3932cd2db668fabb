//! The session actor: journal, compaction, event fan-out and the turn
//! driver that ties them together into the agent loop.

pub mod compaction;
pub mod events;
pub mod journal;
pub mod session;

pub use compaction::{
    build_effective_context, estimate_branch_tokens, estimate_entry_tokens, estimate_request_context_tokens, estimate_text_tokens,
    find_cut_point, run_compaction, should_compact, should_force_compact_by_message_count, CompactionResult, CutPointOptions,
    EffectiveContext, MessageCountBudget,
};
pub use events::{Envelope, EventFanOut, MailboxSubscription, MessageDelta, SessionEvent, StreamSubscription};
pub use journal::SessionJournal;
pub use session::{
    spawn_session, Diagnostics, HealthStatus, LoopState, SessionConfig, SessionHandle, SessionStats,
};
