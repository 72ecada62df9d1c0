//! Refresh-token persistence against a live Postgres; set `GARDISTO_TEST_DSN` to run.

use anyhow::Result;
use gardisto::security::{
    refresh::{ClientContext, PgRefreshTokenStore, RefreshTokenStore, SessionOwner},
    Role,
};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use ulid::Ulid;

async fn store(ttl: Duration) -> Result<Option<PgRefreshTokenStore>> {
    let Ok(dsn) = std::env::var("GARDISTO_TEST_DSN") else {
        eprintln!("Skipping integration test: GARDISTO_TEST_DSN not set");
        return Ok(None);
    };
    let pool = PgPoolOptions::new().max_connections(2).connect(&dsn).await?;
    let store = PgRefreshTokenStore::new(pool, ttl);
    store.ensure_schema().await?;
    Ok(Some(store))
}

fn owner(role: Role) -> SessionOwner {
    SessionOwner::new(format!("{}@gardisto.test", Ulid::new()).to_lowercase(), role)
}

#[tokio::test]
async fn new_login_replaces_the_previous_token() -> Result<()> {
    let Some(store) = store(Duration::from_secs(3600)).await? else {
        return Ok(());
    };
    let owner = owner(Role::Student);
    let client = ClientContext {
        ip: Some("198.51.100.7".to_string()),
        user_agent: Some("integration".to_string()),
    };

    let first = store.create(&owner, &client).await?;
    let verified = store.verify(&first.value).await?;
    assert_eq!(verified.map(|record| record.owner), Some(owner.clone()));

    let second = store.create(&owner, &client).await?;
    assert_ne!(first.value, second.value);
    assert!(store.verify(&first.value).await?.is_none());
    assert!(store.verify(&second.value).await?.is_some());

    // Same email under another role is a separate session.
    let advisor = SessionOwner::new(owner.email.clone(), Role::Fa);
    let third = store.create(&advisor, &client).await?;
    assert!(store.verify(&second.value).await?.is_some());
    assert!(store.verify(&third.value).await?.is_some());

    store.invalidate(&second.value).await?;
    store.invalidate(&third.value).await?;
    assert!(store.verify(&second.value).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn expired_tokens_are_rejected_and_purged() -> Result<()> {
    let Some(store) = store(Duration::from_secs(1)).await? else {
        return Ok(());
    };
    let purged = store.create(&owner(Role::Admin), &ClientContext::default()).await?;
    let presented = store.create(&owner(Role::Admin), &ClientContext::default()).await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(store.verify(&presented.value).await?.is_none());
    assert!(store.purge_expired().await? >= 1);
    assert!(store.verify(&purged.value).await?.is_none());
    Ok(())
}
