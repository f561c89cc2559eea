pub mod actor;
pub mod controller;
pub mod counter;
pub mod event;
pub mod group;
pub mod job;
pub mod joblet;
pub mod options;
pub mod schedule;
pub mod spec;
pub mod state;
pub mod task;
