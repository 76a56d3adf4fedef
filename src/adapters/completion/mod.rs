//! Completion provider adapters.

pub mod openai_compatible;
pub mod scripted;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use scripted::{RecordedCall, ScriptedProvider};
