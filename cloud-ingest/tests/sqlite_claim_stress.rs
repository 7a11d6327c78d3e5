use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use rand::random;
use tempfile::TempDir;
use tokio::task::JoinSet;

use cloud_ingest::database::repositories::{SqlxPollTaskStore, TaskStore};
use cloud_ingest::database::{DbPool, init_pool_with_size, run_migrations};
use cloud_ingest::domain::{PollTask, StreamId, Task, TaskState};

async fn file_pool(dir: &TempDir) -> DbPool {
    let db_path = dir.path().join("claims.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool_with_size(&db_url, 16).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sqlite_claim_no_double_claims_or_lost_transitions() {
    const TASKS: i64 = 120;
    const WORKERS: usize = 12;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqlxPollTaskStore::new(file_pool(&dir).await));

    let now = Utc::now();
    for i in 0..TASKS {
        let at = now - chrono::Duration::seconds(i);
        store
            .save(&PollTask::new(StreamId::new(i % 7, i), at, at))
            .await
            .unwrap();
    }

    let claimed_ids = Arc::new(DashSet::<StreamId>::new());
    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let store = store.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            while let Some(task) = store.claim_queued().await.unwrap() {
                assert_eq!(task.state, TaskState::Claimed);
                assert!(claimed_ids.insert(task.id), "double-claimed task {}", task.id);

                if random::<u8>() % 3 == 0 {
                    tokio::task::yield_now().await;
                }

                let done = task.with_state(TaskState::Completed);
                assert!(
                    store.update(&done, TaskState::Claimed).await.unwrap(),
                    "completion of {} was lost",
                    task.id
                );
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    assert_eq!(claimed_ids.len(), TASKS as usize, "not all tasks were claimed");
    for i in 0..TASKS {
        let task = store.get(StreamId::new(i % 7, i)).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_update_state_exactly_one_wins() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqlxPollTaskStore::new(file_pool(&dir).await));
    let id = StreamId::new(5, 5);
    let now = Utc::now();
    store
        .save(&PollTask::new(id, now, now).with_state(TaskState::Claimed))
        .await
        .unwrap();

    let mut set = JoinSet::new();
    for _ in 0..10 {
        let store = store.clone();
        set.spawn(async move {
            store
                .update_state(id, TaskState::Executing, &[TaskState::Claimed])
                .await
                .unwrap()
        });
    }

    let mut wins = 0;
    while let Some(won) = set.join_next().await {
        if won.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(
        store.get(id).await.unwrap().unwrap().state,
        TaskState::Executing
    );
}
