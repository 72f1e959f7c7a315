//! Tests for api session heartbeat batching.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use edgeward::config::EdgewardConfig;
use edgeward::store::Db;
use edgeward::types::Identity;
use edgeward::Env;
use tokio::sync::watch;

async fn env_with_api_session(config: &EdgewardConfig) -> (Env, String) {
    let db = Db::open_in_memory().await.expect("db");
    let env = Env::with_db(db, config);
    let identity = Identity::new("rae", Vec::new());
    env.create(identity.clone()).await.expect("identity");
    let (id, _) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("api session");
    (env, id)
}

#[tokio::test]
async fn marks_coalesce_and_last_write_wins() {
    let (env, id) = env_with_api_session(&EdgewardConfig::default()).await;
    let earlier = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("time");
    let later = Utc.with_ymd_and_hms(2030, 1, 1, 0, 5, 0).single().expect("time");

    env.heartbeats.mark_at(&id, earlier);
    env.heartbeats.mark_at(&id, later);
    assert_eq!(env.heartbeats.pending(), 1);

    assert_eq!(env.heartbeats.flush().await.expect("flush"), 1);
    assert_eq!(env.heartbeats.pending(), 0);
    let stored = env.api_sessions.read(&id).await.expect("read");
    assert_eq!(stored.last_activity_at, later);
}

#[tokio::test]
async fn unknown_api_sessions_do_not_fail_the_batch() {
    let (env, id) = env_with_api_session(&EdgewardConfig::default()).await;
    env.heartbeats.mark(&id);
    env.heartbeats.mark("gone");

    assert_eq!(env.heartbeats.flush().await.expect("flush"), 1);
    assert_eq!(env.heartbeats.flush().await.expect("empty flush"), 0);
}

#[tokio::test]
async fn full_batch_flushes_early() {
    let mut config = EdgewardConfig::default();
    config.activity.batch_size = 2;
    config.activity.interval_secs = 3_600;
    let (env, first) = env_with_api_session(&config).await;
    let identity_id = env.api_sessions.read(&first).await.expect("read").identity_id;
    let (second, _) = env
        .api_sessions
        .create(&identity_id, Vec::new())
        .await
        .expect("api session");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = env.spawn_background(shutdown_rx);

    let marked_at = Utc.with_ymd_and_hms(2031, 6, 1, 12, 0, 0).single().expect("time");
    env.heartbeats.mark_at(&first, marked_at);
    env.heartbeats.mark_at(&second, marked_at);

    let mut flushed = false;
    for _ in 0..100 {
        if env.heartbeats.pending() == 0
            && env.api_sessions.read(&second).await.expect("read").last_activity_at == marked_at
        {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(flushed, "a full batch should flush before the interval");

    shutdown_tx.send(true).expect("shutdown");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }
}

#[tokio::test]
async fn shutdown_flushes_pending_marks() {
    let mut config = EdgewardConfig::default();
    config.activity.interval_secs = 3_600;
    let (env, id) = env_with_api_session(&config).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = env.spawn_background(shutdown_rx);

    let marked_at = Utc.with_ymd_and_hms(2032, 2, 2, 2, 2, 2).single().expect("time");
    env.heartbeats.mark_at(&id, marked_at);

    shutdown_tx.send(true).expect("shutdown");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }

    assert_eq!(env.heartbeats.pending(), 0);
    let stored = env.api_sessions.read(&id).await.expect("read");
    assert_eq!(stored.last_activity_at, marked_at);
}
