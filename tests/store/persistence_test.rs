//! Tests for file-backed databases opened through `Env::open`.

use edgeward::config::EdgewardConfig;
use edgeward::store::Repository;
use edgeward::types::Identity;
use edgeward::Env;

#[tokio::test]
async fn entities_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EdgewardConfig::default();
    config.database.path = Some(
        dir.path()
            .join("edgeward.db")
            .to_string_lossy()
            .into_owned(),
    );

    let identity = Identity::new("gina", vec!["ops".to_owned()]);
    {
        let env = Env::open(&config).await.expect("open");
        env.create(identity.clone()).await.expect("identity");
        env.db.close().await;
    }

    let env = Env::open(&config).await.expect("reopen");
    let mut tx = env.db.view().await.expect("view");
    let loaded = Identity::load(&mut tx, &identity.id)
        .await
        .expect("load")
        .expect("identity persisted");
    assert_eq!(loaded.name, "gina");
    assert_eq!(loaded.role_attributes, vec!["ops".to_owned()]);
}
