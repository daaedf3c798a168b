//! Workflow definitions, run state and the supervisor that drives them.

mod builder;
mod run;
mod stage;
mod supervisor;


pub use builder::{WorkflowBuilder, WorkflowDefinition};
pub use run::{Cursor, PendingRequest, StageOutcome, StageResult, WorkflowRun};
pub use stage::{
    FnCollaborator, Route, Routing, StageCall, StageCollaborator, StageDefaults, StageDefinition,
    StageInput,
};
pub use supervisor::{Supervisor, SupervisorBuilder};
