// src/pipeline/orchestrate.rs

//! Run-level coordination: validate the plan, spawn one worker per
//! credential, gather their results, and write the final merge.
//!
//! Worker failures are isolated: a failed worker is logged and skipped,
//! and the final document is still produced from the workers that
//! finished. The run fails outright only when the plan is invalid or
//! every worker failed.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::{AppError, Result};
use crate::models::{
    CollectionPlan, CollectionTarget, CollectorConfig, WorkerAssignment, WorkerScope,
};
use crate::pipeline::merge::{self, FinalResult};
use crate::pipeline::worker::CollectionWorker;
use crate::services::ApiClient;
use crate::storage::{CheckpointStore, UserRegistry};

/// Outcome of one collection run.
#[derive(Debug)]
pub struct RunReport {
    pub result: FinalResult,
    pub output_path: PathBuf,
    pub failed_workers: Vec<usize>,
}

pub struct Orchestrator {
    collector: CollectorConfig,
    data_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(collector: CollectorConfig, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            collector,
            data_dir: data_dir.into(),
        }
    }

    /// Run the plan to completion. `make_client` is called once per
    /// worker; each worker authenticates its own client with its own
    /// credential.
    pub async fn run<F>(
        &self,
        plan: CollectionPlan,
        make_client: F,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunReport>
    where
        F: Fn() -> Result<Arc<dyn ApiClient>>,
    {
        if plan.credentials.is_empty() {
            return Err(AppError::config("no credentials configured"));
        }
        if plan.scopes.len() != plan.credentials.len() {
            return Err(AppError::config(format!(
                "{} scopes for {} credentials",
                plan.scopes.len(),
                plan.credentials.len()
            )));
        }
        let batch_target = matches!(plan.target, CollectionTarget::UserBatch { .. });
        if plan
            .scopes
            .iter()
            .any(|scope| matches!(scope, WorkerScope::UserShare(_)) != batch_target)
        {
            return Err(AppError::config(
                "user-share scopes go with batch targets, window scopes with the rest",
            ));
        }

        let job = plan.target.job_name(&plan.windows());
        log::info!(
            "job {job}: {} workers, strategy {}",
            plan.credentials.len(),
            plan.strategy.as_str()
        );
        let store = Arc::new(CheckpointStore::new(&self.data_dir, &job));
        let registry = Arc::new(UserRegistry::new(self.data_dir.join("users")));
        let worker_limit = plan.worker_limit();

        let mut handles = Vec::new();
        for (id, (credential, scope)) in
            plan.credentials.iter().zip(&plan.scopes).enumerate()
        {
            let assignment = WorkerAssignment {
                credential: credential.clone(),
                scope: scope.clone(),
                limit: worker_limit,
            };
            let worker = CollectionWorker::new(
                id,
                assignment,
                plan.target.clone(),
                make_client()?,
                Arc::clone(&registry),
                Arc::clone(&store),
                &self.collector,
                Arc::clone(&cancel),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        let mut results = Vec::new();
        let mut failed_workers = Vec::new();
        for (id, joined) in futures::future::join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    log::error!("worker {id} failed: {e}");
                    failed_workers.push(id);
                }
                Err(e) => {
                    log::error!("worker {id} panicked: {e}");
                    failed_workers.push(id);
                }
            }
        }
        if results.is_empty() {
            return Err(AppError::api(&job, "all workers failed"));
        }

        let result = merge::merge_final(&store, &plan, results).await?;
        Ok(RunReport {
            output_path: store.final_path(),
            result,
            failed_workers,
        })
    }
}
