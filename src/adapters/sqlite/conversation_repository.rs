//! SQLite implementation of the ConversationRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_enum, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentCallRecord, AgentRole, CallFilter, CallStatus, CompletionCall, Conversation, Message,
    MessageMetadata, MessageRole, Page, PipelineStep,
};
use crate::domain::ports::ConversationRepository;

const CONVERSATION_COLUMNS: &str = "id, run_id, agent, step, total_tokens, total_cost, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sequence, role, content, artifacts, metadata, created_at";
const CALL_COLUMNS: &str = "c.id, c.conversation_id, c.deployment, c.prompt_tokens, c.completion_tokens, c.total_tokens, c.requested_max_tokens, c.latency_ms, c.status, c.error_code, c.truncated_sections, c.prompt_hash, c.response_hash, c.budget, c.cost, c.attempts, c.created_at";

#[derive(Clone)]
pub struct SqliteConversationRepository {
    pool: SqlitePool,
}

impl SqliteConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for SqliteConversationRepository {
    async fn get_or_create(
        &self,
        run_id: Uuid,
        agent: AgentRole,
        step: PipelineStep,
    ) -> DomainResult<Conversation> {
        sqlx::query(
            r#"INSERT INTO conversations (id, run_id, agent, step, total_tokens, total_cost, created_at)
               VALUES (?, ?, ?, ?, 0, 0, ?)
               ON CONFLICT(run_id, agent, step) DO NOTHING"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(run_id.to_string())
        .bind(agent.as_str())
        .bind(step.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row: ConversationRow = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE run_id = ? AND agent = ? AND step = ?"
        ))
        .bind(run_id.to_string())
        .bind(agent.as_str())
        .bind(step.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE run_id = ? ORDER BY created_at, rowid"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        artifacts: &[String],
        metadata: &MessageMetadata,
    ) -> DomainResult<Message> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let artifacts_json = serde_json::to_string(artifacts)?;
        let metadata_json = serde_json::to_string(metadata)?;

        // Sequence is computed inside the insert so concurrent appends cannot collide silently.
        let (sequence,): (i64,) = sqlx::query_as(
            r#"INSERT INTO messages (id, conversation_id, sequence, role, content, artifacts, metadata, created_at)
               SELECT ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?, ?
               FROM messages WHERE conversation_id = ?
               RETURNING sequence"#,
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(&artifacts_json)
        .bind(&metadata_json)
        .bind(created_at.to_rfc3339())
        .bind(conversation_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id,
            conversation_id,
            sequence,
            role,
            content: content.to_string(),
            artifacts: artifacts.to_vec(),
            metadata: metadata.clone(),
            created_at,
        })
    }

    async fn list_messages(&self, conversation_id: Uuid, page: Page) -> DomainResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY sequence LIMIT ? OFFSET ?"
        ))
        .bind(conversation_id.to_string())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn record_call(
        &self,
        call: &CompletionCall,
        record: &AgentCallRecord,
    ) -> DomainResult<()> {
        let truncated_json = serde_json::to_string(&call.truncated_sections)?;
        let budget_json = serde_json::to_string(&call.budget)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO completion_calls (id, conversation_id, deployment, prompt_tokens, completion_tokens, total_tokens,
                   requested_max_tokens, latency_ms, status, error_code, truncated_sections, prompt_hash, response_hash,
                   budget, cost, attempts, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(call.id.to_string())
        .bind(call.conversation_id.to_string())
        .bind(&call.deployment)
        .bind(call.prompt_tokens)
        .bind(call.completion_tokens)
        .bind(call.total_tokens)
        .bind(call.requested_max_tokens)
        .bind(call.latency_ms)
        .bind(call.status.as_str())
        .bind(&call.error_code)
        .bind(&truncated_json)
        .bind(&call.prompt_hash)
        .bind(&call.response_hash)
        .bind(&budget_json)
        .bind(call.cost)
        .bind(i64::from(call.attempts))
        .bind(call.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE conversations SET total_tokens = total_tokens + ?, total_cost = total_cost + ? WHERE id = ?",
        )
        .bind(call.total_tokens)
        .bind(call.cost)
        .bind(call.conversation_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DomainError::ConversationNotFound(call.conversation_id));
        }

        sqlx::query(
            r#"INSERT INTO agent_call_history (id, run_id, agent, step, call_id, status, total_tokens, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.agent.as_str())
        .bind(record.step.as_str())
        .bind(record.call_id.to_string())
        .bind(record.status.as_str())
        .bind(record.total_tokens)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_calls(&self, filter: CallFilter) -> DomainResult<Vec<CompletionCall>> {
        let mut query = format!(
            "SELECT {CALL_COLUMNS} FROM completion_calls c JOIN conversations v ON v.id = c.conversation_id WHERE 1=1"
        );
        let mut bindings: Vec<String> = Vec::new();

        if let Some(run_id) = &filter.run_id {
            query.push_str(" AND v.run_id = ?");
            bindings.push(run_id.to_string());
        }

        if let Some(agent) = &filter.agent {
            query.push_str(" AND v.agent = ?");
            bindings.push(agent.as_str().to_string());
        }

        if let Some(step) = &filter.step {
            query.push_str(" AND v.step = ?");
            bindings.push(step.as_str().to_string());
        }

        if let Some(status) = &filter.status {
            query.push_str(" AND c.status = ?");
            bindings.push(status.as_str().to_string());
        }

        query.push_str(" ORDER BY c.created_at, c.rowid");
        query.push_str(&format!(
            " LIMIT {} OFFSET {}",
            filter.limit.unwrap_or(100),
            filter.offset.unwrap_or(0)
        ));

        let mut q = sqlx::query_as::<_, CompletionCallRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<CompletionCallRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn call_history(
        &self,
        run_id: Uuid,
        agent: Option<AgentRole>,
    ) -> DomainResult<Vec<AgentCallRecord>> {
        let rows: Vec<AgentCallRow> = match agent {
            Some(agent) => {
                sqlx::query_as(
                    "SELECT id, run_id, agent, step, call_id, status, total_tokens, created_at FROM agent_call_history WHERE run_id = ? AND agent = ? ORDER BY created_at, rowid",
                )
                .bind(run_id.to_string())
                .bind(agent.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, run_id, agent, step, call_id, status, total_tokens, created_at FROM agent_call_history WHERE run_id = ? ORDER BY created_at, rowid",
                )
                .bind(run_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    run_id: String,
    agent: String,
    step: String,
    total_tokens: i64,
    total_cost: f64,
    created_at: String,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = DomainError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: parse_uuid(&row.id)?,
            run_id: parse_uuid(&row.run_id)?,
            agent: parse_enum("agent", &row.agent, AgentRole::from_str)?,
            step: parse_enum("step", &row.step, PipelineStep::from_str)?,
            total_tokens: row.total_tokens,
            total_cost: row.total_cost,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sequence: i64,
    role: String,
    content: String,
    artifacts: String,
    metadata: String,
    created_at: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = DomainError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: parse_uuid(&row.id)?,
            conversation_id: parse_uuid(&row.conversation_id)?,
            sequence: row.sequence,
            role: parse_enum("role", &row.role, MessageRole::from_str)?,
            content: row.content,
            artifacts: serde_json::from_str(&row.artifacts)?,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CompletionCallRow {
    id: String,
    conversation_id: String,
    deployment: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    requested_max_tokens: i64,
    latency_ms: i64,
    status: String,
    error_code: Option<String>,
    truncated_sections: String,
    prompt_hash: String,
    response_hash: Option<String>,
    budget: String,
    cost: f64,
    attempts: i64,
    created_at: String,
}

impl TryFrom<CompletionCallRow> for CompletionCall {
    type Error = DomainError;

    fn try_from(row: CompletionCallRow) -> Result<Self, Self::Error> {
        Ok(CompletionCall {
            id: parse_uuid(&row.id)?,
            conversation_id: parse_uuid(&row.conversation_id)?,
            deployment: row.deployment,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            total_tokens: row.total_tokens,
            requested_max_tokens: row.requested_max_tokens,
            latency_ms: row.latency_ms,
            status: parse_enum("status", &row.status, CallStatus::from_str)?,
            error_code: row.error_code,
            truncated_sections: serde_json::from_str(&row.truncated_sections)?,
            prompt_hash: row.prompt_hash,
            response_hash: row.response_hash,
            budget: serde_json::from_str(&row.budget)?,
            cost: row.cost,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentCallRow {
    id: String,
    run_id: String,
    agent: String,
    step: String,
    call_id: String,
    status: String,
    total_tokens: i64,
    created_at: String,
}

impl TryFrom<AgentCallRow> for AgentCallRecord {
    type Error = DomainError;

    fn try_from(row: AgentCallRow) -> Result<Self, Self::Error> {
        Ok(AgentCallRecord {
            id: parse_uuid(&row.id)?,
            run_id: parse_uuid(&row.run_id)?,
            agent: parse_enum("agent", &row.agent, AgentRole::from_str)?,
            step: parse_enum("step", &row.step, PipelineStep::from_str)?,
            call_id: parse_uuid(&row.call_id)?,
            status: parse_enum("status", &row.status, CallStatus::from_str)?,
            total_tokens: row.total_tokens,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}
