pub mod chunk_list;
pub mod chunk_pool;
pub mod cluster;
pub mod digest;
pub mod error;
pub mod id;
pub mod master;
pub mod operation;
pub mod resources;
mod snapshot;
#[cfg(test)]
pub(crate) mod testing;

pub use operation::actor::{ControllerActor, ControllerActorOptions};
pub use operation::controller::{OperationController, OperationProgress, ReviveOutcome};
pub use operation::event::ControllerEvent;
pub use operation::schedule::{ScheduleFailReason, ScheduleJobResult};
pub use operation::spec::{OperationSpec, TaskDefinition};
