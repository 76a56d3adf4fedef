//! Adapters implementing the domain ports.

pub mod checkpoint;
pub mod collaborators;
pub mod completion;
pub mod github;
pub mod sqlite;
