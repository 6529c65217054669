//! Ports - the traits at the seams between the core and its collaborators

pub mod actor;
pub mod checkpoint;
pub mod executor;
pub mod journal;
pub mod storage;
