mod actor;

pub use actor::{Actor, ActorAction, ActorHandle};
