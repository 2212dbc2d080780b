mod autosave;
mod cache;
mod coordinator;
mod resumption;
mod store;
mod timer;
mod view;

// Public API of the session subsystem.
pub use autosave::{
    AutoSavePolicy, FlushApplied, FlushDecision, FlushTicket, SaveFailure, SaveStatus, SaveTrigger,
};
pub use cache::SessionListCache;
pub use coordinator::{FlushJob, FlushOutcome, FlushPlan, FlushReport, SessionCoordinator, SessionEvent};
pub use resumption::{ResumeTarget, ResumptionRegistry};
pub use store::{SessionStore, TickOutcome};
pub use timer::{TimeWarning, TimerController, TimerReport, TimerState};
pub use view::{AttemptListItem, SessionView};
