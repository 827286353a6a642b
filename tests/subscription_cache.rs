use sqlx::PgPool;

use entitlements::store::{EntitlementStore, LineItem};

mod common;

fn item(price_id: &str, quantity: i64) -> LineItem {
    LineItem {
        price_id: price_id.to_string(),
        product_id: None,
        quantity,
    }
}

// key: subscription-cache-tests -> wholesale-replace,unknown-prices,status-gate
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn replace_is_wholesale(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let files = common::seed_product(&pool, "Files", "files", true, None).await;
    let notes = common::seed_product(&pool, "Notes", "notes", false, None).await;
    common::seed_price(&pool, files, "price_files").await;
    common::seed_price(&pool, notes, "price_notes").await;
    let profile_id = common::seed_profile(&pool, "ada@example.com", "kc-ada", "active").await;

    store
        .replace_subscription_items(profile_id, &[item("price_files", 1)])
        .await
        .unwrap();
    store
        .replace_subscription_items(profile_id, &[item("price_notes", 2)])
        .await
        .unwrap();

    let items = store.subscription_items(profile_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].stripe_price_id, "price_notes");
    assert_eq!(items[0].product_id, notes);
    assert_eq!(items[0].quantity, 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_prices_are_dropped_not_fatal(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let files = common::seed_product(&pool, "Files", "files", true, None).await;
    common::seed_price(&pool, files, "price_files").await;
    let profile_id = common::seed_profile(&pool, "ada@example.com", "kc-ada", "active").await;

    store
        .replace_subscription_items(
            profile_id,
            &[item("price_files", 1), item("price_from_another_catalog", 1)],
        )
        .await
        .unwrap();

    let items = store.subscription_items(profile_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].stripe_price_id, "price_files");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn replaying_the_same_payload_converges(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let files = common::seed_product(&pool, "Files", "files", true, None).await;
    common::seed_price(&pool, files, "price_files").await;
    let profile_id = common::seed_profile(&pool, "ada@example.com", "kc-ada", "active").await;

    let payload = [item("price_files", 3)];
    store
        .replace_subscription_items(profile_id, &payload)
        .await
        .unwrap();
    store
        .replace_subscription_items(profile_id, &payload)
        .await
        .unwrap();

    let items = store.subscription_items(profile_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn canceled_profiles_have_no_subscribed_products(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let files = common::seed_product(&pool, "Files", "files", true, None).await;
    common::seed_price(&pool, files, "price_files").await;
    let profile_id = common::seed_profile(&pool, "ada@example.com", "kc-ada", "canceled").await;
    common::cache_item(&pool, profile_id, files, "price_files").await;

    let profile = store.profile_by_id(profile_id).await.unwrap().unwrap();
    assert!(store.subscribed_products(&profile).await.unwrap().is_empty());

    // past_due keeps grace-period access.
    store
        .set_subscription_status(profile_id, "past_due")
        .await
        .unwrap();
    let profile = store.profile_by_id(profile_id).await.unwrap().unwrap();
    assert_eq!(store.subscribed_products(&profile).await.unwrap().len(), 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn upserting_by_email_converges_on_one_profile(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let first = store
        .upsert_profile("ada@example.com", "ada", "Ada", "L")
        .await
        .unwrap();
    let second = store
        .upsert_profile("ada@example.com", "ada", "Ada", "Lovelace")
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.last_name, "Lovelace");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reparenting_into_a_cycle_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = EntitlementStore::new(pool.clone());

    let suite = common::seed_product(&pool, "Suite", "suite", false, None).await;
    let files = common::seed_product(&pool, "Files", "files", true, None).await;
    let sync = common::seed_product(&pool, "Sync", "sync", true, None).await;

    store.set_product_parent(files, Some(suite)).await.unwrap();
    store.set_product_parent(sync, Some(files)).await.unwrap();

    // suite -> files -> sync; closing the loop must fail.
    let err = store.set_product_parent(suite, Some(sync)).await.unwrap_err();
    assert!(err.to_string().contains("cycle"));

    // Self-parenting is the degenerate cycle.
    assert!(store.set_product_parent(files, Some(files)).await.is_err());

    // Detaching always works.
    store.set_product_parent(files, None).await.unwrap();
}
