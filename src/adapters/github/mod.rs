//! GitHub-backed ticketing and source control.

pub mod client;
pub mod models;

pub use client::GitHubClient;
