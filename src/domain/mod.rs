//! Domain types shared by the workflow engine and the actor runtime

pub mod constant;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod state;
