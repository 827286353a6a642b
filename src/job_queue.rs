use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{sleep, Duration};

use crate::keycloak::IdentityProvider;
use crate::mailer::{self, Mailer};
use crate::reconciler::EntitlementReconciler;

/// Non-critical follow-up work pushed off the webhook path. Execution is
/// at-least-once: jobs are written to the durable queue before the channel
/// send, and queued rows are replayed on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    SyncEntitlements { profile_id: i32 },
    SendPasswordReset { keycloak_id: String },
    NotifySubscriptionCanceled { email: String, first_name: String },
    NotifyPaymentFailed { email: String, first_name: String },
}

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_SECS: u64 = 30;

pub async fn enqueue_job(pool: &PgPool, job: &Job) -> Option<i32> {
    let payload = serde_json::to_value(job).ok()?;
    sqlx::query_scalar("INSERT INTO job_queue (payload) VALUES ($1) RETURNING id")
        .bind(payload)
        .fetch_one(pool)
        .await
        .ok()
}

/// Persist then dispatch. Callers submit only after the state the job
/// depends on is durably committed; the job may run even if later work in
/// the same handler fails. Once the in-process send succeeds the durable
/// copy is dropped so the replay scan never dispatches it a second time;
/// a failed send leaves the row queued for replay.
pub async fn submit(pool: &PgPool, tx: &Sender<Job>, job: Job) {
    let id = enqueue_job(pool, &job).await;
    if tx.send(job).await.is_ok() {
        if let Some(id) = id {
            let _ = sqlx::query("DELETE FROM job_queue WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await;
        }
    }
}

#[derive(Clone)]
pub struct JobContext {
    pub reconciler: EntitlementReconciler,
    pub idp: Arc<dyn IdentityProvider>,
    pub mailer: Arc<dyn Mailer>,
}

pub fn start_worker(pool: PgPool, ctx: JobContext) -> Sender<Job> {
    let (tx, mut rx): (Sender<Job>, Receiver<Job>) = channel(32);

    // Replay jobs left queued by a previous run.
    let db_pool = pool;
    let replay_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            let rows = sqlx::query(
                "SELECT id, payload FROM job_queue WHERE status = 'queued' ORDER BY id",
            )
            .fetch_all(&db_pool)
            .await
            .unwrap_or_default();
            for row in rows {
                let id: i32 = row.get("id");
                let payload: Value = row.get("payload");
                if let Ok(job) = serde_json::from_value::<Job>(payload) {
                    let _ = sqlx::query("UPDATE job_queue SET status = 'processing' WHERE id = $1")
                        .bind(id)
                        .execute(&db_pool)
                        .await;
                    let _ = replay_tx.send(job).await;
                    let _ = sqlx::query("DELETE FROM job_queue WHERE id = $1")
                        .bind(id)
                        .execute(&db_pool)
                        .await;
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
    });

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                run_with_retries(&ctx, job).await;
            });
        }
    });
    tx
}

/// Bounded retries with exponential backoff so a slow downstream never
/// blocks the webhook path or wedges the worker.
async fn run_with_retries(ctx: &JobContext, job: Job) {
    for attempt in 0..MAX_ATTEMPTS {
        match run_job(ctx, &job).await {
            Ok(()) => {
                tracing::info!(?job, attempt, "job completed");
                return;
            }
            Err(err) if attempt + 1 < MAX_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY_SECS * 2u64.pow(attempt);
                tracing::warn!(?err, ?job, attempt, delay, "job failed; retrying");
                sleep(Duration::from_secs(delay)).await;
            }
            Err(err) => {
                tracing::error!(?err, ?job, "job failed after {MAX_ATTEMPTS} attempts");
            }
        }
    }
}

async fn run_job(ctx: &JobContext, job: &Job) -> Result<()> {
    match job {
        Job::SyncEntitlements { profile_id } => {
            ctx.reconciler.sync_entitlements(*profile_id).await
        }
        Job::SendPasswordReset { keycloak_id } => {
            let sent = ctx.idp.send_reset_password_email(keycloak_id).await?;
            if !sent {
                return Err(anyhow!("password reset email rejected for {keycloak_id}"));
            }
            Ok(())
        }
        Job::NotifySubscriptionCanceled { email, first_name } => {
            let (text, html) = mailer::canceled_body(first_name);
            ctx.mailer
                .send(email, mailer::canceled_subject(), &text, &html)
                .await
        }
        Job::NotifyPaymentFailed { email, first_name } => {
            let (text, html) = mailer::payment_failed_body(first_name);
            ctx.mailer
                .send(email, mailer::payment_failed_subject(), &text, &html)
                .await
        }
    }
}
