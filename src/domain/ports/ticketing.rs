//! Ticketing system port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::Ticket;

#[async_trait]
pub trait TicketingClient: Send + Sync {
    /// Fetch a ticket by its external reference.
    async fn get_ticket(&self, id: &str) -> DomainResult<Ticket>;
}
