//! Port trait definitions (Hexagonal Architecture)
//!
//! Async trait interfaces the core depends on and adapters implement:
//! - RunRepository / ConversationRepository: durable run and ledger storage
//! - CompletionProvider: model completion endpoints
//! - TicketingClient / SourceControlClient: external collaborators
//! - CheckpointStore: durable run progress

pub mod checkpoint_store;
pub mod completion_provider;
pub mod conversation_repository;
pub mod run_repository;
pub mod source_control;
pub mod ticketing;

pub use checkpoint_store::CheckpointStore;
pub use completion_provider::{
    ChatMessage, CompletionError, CompletionProvider, CompletionResponse,
};
pub use conversation_repository::ConversationRepository;
pub use run_repository::RunRepository;
pub use source_control::SourceControlClient;
pub use ticketing::TicketingClient;
