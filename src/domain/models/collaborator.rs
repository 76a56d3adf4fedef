//! Value types exchanged with ticketing and source-control collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A ticket fetched from the ticketing system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Ticket {
    /// Deterministic placeholder used when the ticketing system is unavailable.
    pub fn placeholder(id: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("source".to_string(), "placeholder".to_string());
        Self {
            id: id.to_string(),
            title: format!("Ticket {id}"),
            description: format!(
                "No ticket content was available for {id}. Proceed using the ticket reference only."
            ),
            fields,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.fields.get("source").map(String::as_str) == Some("placeholder")
    }
}

/// A file to be committed to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// A pull request opened on the source-control host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub url: String,
    pub number: u64,
}

/// A CI check attached to a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}
