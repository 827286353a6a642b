use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::models::Instance;

/// key: capacity-allocator -> seat reservation under row locks
///
/// Selection and increment happen in one transaction. `FOR UPDATE SKIP
/// LOCKED` lets concurrent allocations for the same product converge onto
/// the N least-loaded available instances instead of queuing behind a
/// single row lock.
pub async fn try_allocate_seat(
    tx: &mut Transaction<'_, Postgres>,
    product_id: i32,
) -> Result<Option<Instance>> {
    let candidate = sqlx::query_as::<_, Instance>(
        r#"
        SELECT *
        FROM instances
        WHERE product_id = $1
          AND is_active = TRUE
          AND auto_allocate = TRUE
          AND allocated_seats < allocation_cap
        ORDER BY allocated_seats, name
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(instance) = candidate else {
        warn!(%product_id, "no instance capacity available for new assignment");
        return Ok(None);
    };

    let instance = sqlx::query_as::<_, Instance>(
        "UPDATE instances SET allocated_seats = allocated_seats + 1 WHERE id = $1 RETURNING *",
    )
    .bind(instance.id)
    .fetch_one(&mut *tx)
    .await?;

    Ok(Some(instance))
}

/// Allocate in a self-contained transaction. Callers that already hold a
/// profile lock use `try_allocate_seat` inside their own transaction.
pub async fn allocate_seat(pool: &PgPool, product_id: i32) -> Result<Option<Instance>> {
    let mut tx = pool.begin().await?;
    let instance = try_allocate_seat(&mut tx, product_id).await?;
    tx.commit().await?;
    Ok(instance)
}

/// Release one seat, floored at zero. Decrementing a seat that was never
/// counted must not underflow.
pub async fn release_seat(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET allocated_seats = GREATEST(allocated_seats - 1, 0) WHERE id = $1",
    )
    .bind(instance_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}
