//! Terminal status is written at most once, whatever the call order.

use std::sync::Arc;

use proptest::prelude::*;
use test_strategy::proptest;

use foreman::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};
use foreman::domain::models::{Run, RunStatus};
use foreman::domain::ports::RunRepository;
use foreman::services::{EventBus, FinalizeOutcome, StatusFinalizer};

#[derive(Debug, Clone, Copy)]
enum Attempt {
    Complete,
    Fail,
    Cancel,
}

fn attempt() -> impl Strategy<Value = Attempt> {
    prop_oneof![
        Just(Attempt::Complete),
        Just(Attempt::Fail),
        Just(Attempt::Cancel),
    ]
}

const fn expected_status(attempt: Attempt) -> RunStatus {
    match attempt {
        Attempt::Complete => RunStatus::Completed,
        Attempt::Fail => RunStatus::Failed,
        Attempt::Cancel => RunStatus::Cancelled,
    }
}

#[proptest(ProptestConfig { cases: 24, ..ProptestConfig::default() })]
fn first_terminal_status_wins(
    #[strategy(proptest::collection::vec(attempt(), 1..6))] attempts: Vec<Attempt>,
    start_running: bool,
) {
    let (outcomes, stored) = tokio_test::block_on(async {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = Arc::new(SqliteRunRepository::new(pool));
        let finalizer = StatusFinalizer::new(repo.clone(), Arc::new(EventBus::default()));
        let run = Run::new("T-prop");
        repo.create(&run).await.unwrap();
        if start_running {
            finalizer.mark_running(run.id).await.unwrap();
        }

        let mut outcomes = Vec::new();
        for attempt in &attempts {
            let outcome = match attempt {
                Attempt::Complete => finalizer.finalize(run.id, RunStatus::Completed, None).await,
                Attempt::Fail => {
                    finalizer
                        .finalize(run.id, RunStatus::Failed, Some("boom"))
                        .await
                }
                Attempt::Cancel => finalizer.cancel(run.id).await,
            };
            outcomes.push(outcome.unwrap());
        }
        (outcomes, repo.get(run.id).await.unwrap().unwrap())
    });

    let winner = expected_status(attempts[0]);
    prop_assert_eq!(outcomes[0], FinalizeOutcome::Applied);
    for outcome in &outcomes[1..] {
        prop_assert_eq!(*outcome, FinalizeOutcome::AlreadyTerminal(winner));
    }
    prop_assert_eq!(stored.status, winner);
    prop_assert!(stored.finished_at.is_some());
    prop_assert_eq!(stored.error.is_some(), winner != RunStatus::Completed);
}
