//! Activation request/response types carried between workers and the engine.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{JobKey, JobKind, JobRecord, JobType};

/// A pull-style activation request.
///
/// `request_timeout` is how long the engine may hold the request open waiting
/// for work; zero means "answer with whatever is available right now".
/// `job_timeout` is the activation deadline granted per job (engine default
/// when `None`).
#[derive(Debug, Clone)]
pub struct ActivateJobsRequest {
    pub job_type: JobType,
    pub worker: String,
    pub max_jobs_to_activate: u32,
    pub request_timeout: Duration,
    pub job_timeout: Option<Duration>,
    /// Restrict the materialized variables to these names; `None` fetches all.
    pub fetch_variables: Option<Vec<String>>,
    pub kind: JobKind,
}

impl ActivateJobsRequest {
    pub fn new(job_type: JobType, worker: impl Into<String>, max_jobs_to_activate: u32) -> Self {
        Self {
            job_type,
            worker: worker.into(),
            max_jobs_to_activate,
            request_timeout: Duration::ZERO,
            job_timeout: None,
            fetch_variables: None,
            kind: JobKind::Ordinary,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_fetch_variables(mut self, names: Vec<String>) -> Self {
        self.fetch_variables = Some(names);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A job handed to a worker, by poll response or stream push.
#[derive(Debug, Clone)]
pub struct ActivatedJob {
    pub key: JobKey,
    pub job_type: JobType,
    pub kind: JobKind,
    pub worker: String,
    pub retries: u32,
    pub deadline: Instant,
    pub variables: serde_json::Value,
    pub custom_headers: HashMap<String, String>,
    pub tags: Vec<String>,
}

impl ActivatedJob {
    /// Materialize the worker-facing view of a freshly activated record,
    /// optionally narrowing variables to the requested names.
    pub(crate) fn from_record(record: &JobRecord, fetch_variables: Option<&[String]>) -> Self {
        let variables = match fetch_variables {
            None => record.variables.clone(),
            Some(names) => filter_variables(&record.variables, names),
        };
        Self {
            key: record.key,
            job_type: record.job_type.clone(),
            kind: record.kind,
            worker: record.worker.clone().unwrap_or_default(),
            retries: record.retries,
            deadline: record.deadline.unwrap_or_else(Instant::now),
            variables,
            custom_headers: record.custom_headers.clone(),
            tags: record.tags.clone(),
        }
    }
}

fn filter_variables(variables: &serde_json::Value, names: &[String]) -> serde_json::Value {
    match variables {
        serde_json::Value::Object(map) => {
            let filtered: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .filter_map(|name| map.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            serde_json::Value::Object(filtered)
        }
        other => other.clone(),
    }
}
