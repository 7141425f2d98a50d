//! Worker: dispatches delivered jobs by kind.
//!
//! `score-all-users` fans out into one independent `score-user` job per
//! user and succeeds as soon as they are enqueued. `score-user` runs the
//! scoring engine for a single user. A child's failure, retries included,
//! stays with that child.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::{Broker, Consumer, ConsumerConfig, JobHandler, LoggingObserver};
use crate::error::Result;
use crate::model::job::{Job, JobPayload};
use crate::scheduler::score_user_options;
use crate::scoring::ScoringEngine;
use crate::store::UserDirectory;

pub struct Worker {
    broker: Arc<dyn Broker>,
    directory: Arc<dyn UserDirectory>,
    engine: Arc<ScoringEngine>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        directory: Arc<dyn UserDirectory>,
        engine: Arc<ScoringEngine>,
    ) -> Self {
        Self {
            broker,
            directory,
            engine,
        }
    }

    /// Build the consumer bound to this worker's broker handle, with the
    /// logging observer attached.
    pub fn consumer(self: &Arc<Self>, config: ConsumerConfig) -> Consumer {
        Consumer::new(
            Arc::clone(&self.broker),
            Arc::clone(self) as Arc<dyn JobHandler>,
            config,
        )
        .with_observer(Arc::new(LoggingObserver))
    }

    /// Close the worker's broker handle.
    pub async fn close(&self) -> Result<()> {
        self.broker.close().await
    }

    async fn score_all(&self) -> Result<serde_json::Value> {
        let user_ids = self.directory.user_ids().await?;
        info!(users = user_ids.len(), "fanning out per-user scoring");

        for &user_id in &user_ids {
            self.broker
                .enqueue(JobPayload::score_user(user_id), score_user_options())
                .await?;
        }
        Ok(serde_json::json!({ "enqueued": user_ids.len() }))
    }

    async fn score_one(&self, user_id: i64) -> Result<serde_json::Value> {
        let evaluation = self.engine.score_user(user_id).await?;
        Ok(serde_json::json!({
            "userId": user_id,
            "evaluation": evaluation,
        }))
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value> {
        match job.decode()? {
            JobPayload::ScoreAllUsers => self.score_all().await,
            JobPayload::ScoreUser { user_id } => self.score_one(user_id).await,
        }
    }
}
