//! Conversation ledger guarantees observed through the wired services.

mod common;

use std::collections::HashSet;

use foreman::domain::models::{
    AgentRole, CallFilter, MessageMetadata, MessageRole, Page, PipelineStep, Prompt,
    PromptSection,
};
use foreman::services::{CompletionRequest, EventPayload};

use common::harness;

#[tokio::test]
async fn test_one_conversation_per_run_agent_step() {
    let h = harness().await;
    let run = h.foreman.engine().create_run("T-1").await.unwrap();
    let ledger = h.foreman.ledger.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .get_or_create_conversation(run.id, AgentRole::Planner, PipelineStep::GeneratePlan)
                .await
                .unwrap()
                .id
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);

    let other = ledger
        .get_or_create_conversation(run.id, AgentRole::Planner, PipelineStep::BreakDownTasks)
        .await
        .unwrap();
    assert!(!ids.contains(&other.id));
    assert_eq!(ledger.conversations_for_run(run.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_message_sequences_are_gapless_under_concurrency() {
    let h = harness().await;
    let run = h.foreman.engine().create_run("T-2").await.unwrap();
    let ledger = h.foreman.ledger.clone();
    let conversation = ledger
        .get_or_create_conversation(run.id, AgentRole::Implementer, PipelineStep::ExecuteTasks)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = ledger.clone();
        let conversation = conversation.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .append_message(
                    &conversation,
                    MessageRole::User,
                    &format!("message {i}"),
                    &[],
                    MessageMetadata::for_step(AgentRole::Implementer, PipelineStep::ExecuteTasks),
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let messages = ledger.messages(conversation.id, Page::default()).await.unwrap();
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_published_calls_match_stored_calls() {
    let h = harness().await;
    let mut events = h.foreman.event_bus.subscribe();
    let run = h.foreman.engine().create_run("T-3").await.unwrap();

    for step in [PipelineStep::RetrieveTicket, PipelineStep::BreakDownTasks] {
        h.foreman
            .completions
            .complete(CompletionRequest::new(
                run.id,
                AgentRole::Planner,
                step,
                Prompt::new().with(PromptSection::fixed("instructions", "Go.")),
            ))
            .await
            .unwrap();
    }

    let mut published = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventPayload::CompletionRecorded { call, record, .. } = event.payload {
            assert_eq!(record.call_id, call.id);
            assert_eq!(record.run_id, run.id);
            published.push(call);
        }
    }

    let stored = h
        .foreman
        .ledger
        .calls(CallFilter {
            run_id: Some(run.id),
            ..CallFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(published.len(), 2);
    for call in &published {
        let found = stored.iter().find(|c| c.id == call.id).expect("stored call");
        assert_eq!(found.prompt_hash, call.prompt_hash);
        assert_eq!(found.total_tokens, call.total_tokens);
        assert_eq!(found.status, call.status);
    }

    let history = h
        .foreman
        .ledger
        .call_history(run.id, Some(AgentRole::Planner))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(h
        .foreman
        .ledger
        .call_history(run.id, Some(AgentRole::Reviewer))
        .await
        .unwrap()
        .is_empty());
}
