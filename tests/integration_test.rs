//! Integration tests against a real Postgres database
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//!
//! Prerequisites:
//! - Postgres reachable at DATABASE_URL (migrations are applied by the test)

use std::str::FromStr;

use bigdecimal::BigDecimal;
use sqlx::PgPool;

use withdrawer::db::{self, PgStore, WithdrawalFilter, WithdrawalStore};
use withdrawer::types::{PersistedWithdrawal, ProcessRecord, ProcessType, Stage, WithdrawalRequest};

mod helpers {
    use super::*;

    /// Connect and migrate, or None when DATABASE_URL is not set
    pub async fn store() -> Option<(PgStore, PgPool)> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = db::create_pool(&url).await.expect("connect to database");
        db::run_migrations(&pool).await.expect("run migrations");
        Some((PgStore::new(pool.clone()), pool))
    }

    /// Asset ticker unique to one test run so tests do not see each other's rows
    pub fn test_asset(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!("T{}{}", tag, nanos)
    }

    pub async fn cleanup(pool: &PgPool, asset: &str) {
        let _ = sqlx::query("DELETE FROM processes WHERE asset = $1")
            .bind(asset)
            .execute(pool)
            .await;
        let _ = sqlx::query("DELETE FROM withdrawals WHERE asset = $1")
            .bind(asset)
            .execute(pool)
            .await;
    }
}

fn withdrawal(asset: &str, id: i64, amount: &str) -> PersistedWithdrawal {
    PersistedWithdrawal::from_request(&WithdrawalRequest {
        id,
        asset: asset.to_string(),
        amount: BigDecimal::from_str(amount).unwrap(),
        address: "bc1qtestaddress".to_string(),
    })
}

#[tokio::test]
#[ignore]
async fn test_withdrawal_lifecycle_in_postgres() {
    let Some((store, pool)) = helpers::store().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let asset = helpers::test_asset("L");

    store
        .insert_withdrawal(&withdrawal(&asset, 1, "0.123456789012345678"))
        .await
        .unwrap();
    assert!(store.insert_withdrawal(&withdrawal(&asset, 1, "1")).await.is_err());
    assert_eq!(store.next_available_id(&asset).await.unwrap(), 2);

    store.mark_sent(&asset, 1, "abc").await.unwrap();
    // Same hash again is accepted, a different hash is not
    store.mark_sent(&asset, 1, "abc").await.unwrap();
    assert!(store.mark_sent(&asset, 1, "other").await.is_err());

    assert_eq!(
        store.withdrawal_id_by_tx_hash(&asset, "abc").await.unwrap(),
        Some(1)
    );
    assert_eq!(store.unfinished_withdrawals(&asset).await.unwrap().len(), 1);

    store.mark_in_chain(&asset, "abc", 100, 3).await.unwrap();
    let stored = store.get_withdrawal(&asset, 1).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Inchain);
    assert_eq!(stored.height, 100);
    assert_eq!(stored.tx_index, 3);
    assert_eq!(
        stored.amount,
        BigDecimal::from_str("0.123456789012345678").unwrap()
    );
    assert!(store.unfinished_withdrawals(&asset).await.unwrap().is_empty());

    let listed = store
        .list_withdrawals(&WithdrawalFilter {
            asset: asset.clone(),
            tx_hash: Some("abc".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    helpers::cleanup(&pool, &asset).await;
}

#[tokio::test]
#[ignore]
async fn test_process_records_in_postgres() {
    let Some((store, pool)) = helpers::store().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let asset = helpers::test_asset("P");

    store
        .save_process(&ProcessRecord::withdraw(9, &asset, Stage::Load))
        .await
        .unwrap();
    let record = ProcessRecord::withdraw(9, &asset, Stage::Inchain)
        .with_tx_hash("abc")
        .with_height(100, 6);
    store.save_process(&record).await.unwrap();

    let loaded = store
        .get_process(&asset, ProcessType::Withdraw, 9)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.stage, Stage::Inchain);
    assert!(!loaded.cancelable);
    assert_eq!(loaded.complete_height, 106);
    assert_eq!(loaded.tx_hash.as_deref(), Some("abc"));

    assert!(store
        .delete_process(&asset, ProcessType::Withdraw, 9)
        .await
        .unwrap());
    assert!(store
        .get_process(&asset, ProcessType::Withdraw, 9)
        .await
        .unwrap()
        .is_none());

    helpers::cleanup(&pool, &asset).await;
}
