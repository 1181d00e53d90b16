//! HTTP task executor

use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Request};
use tracing::{debug, error, info};
use url::Url;

use crate::errors::{TaskError, WorkerError};
use crate::models::application::HttpTask;

/// Executes HTTP tasks
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, task: &HttpTask) -> Result<(), TaskError>;
}

/// HTTP executor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest implementation of [`HttpExecutor`]
pub struct WebhookExecutor {
    client: Client,
}

impl WebhookExecutor {
    pub fn new(options: &Options) -> Result<Self, WorkerError> {
        let client = Client::builder().timeout(options.timeout).build()?;
        Ok(Self { client })
    }

    /// Build the outgoing request; every failure here is the task's fault
    pub fn build_request(&self, task: &HttpTask) -> Result<Request, TaskError> {
        let headers = build_headers(task)?;

        let method = Method::from_bytes(task.method.as_bytes()).map_err(|e| {
            TaskError::unrecoverable(format!("Invalid HTTP method {}: {}", task.method, e))
        })?;

        let url = Url::parse(&task.url)
            .map_err(|e| TaskError::unrecoverable(format!("Invalid URL {}: {}", task.url, e)))?;

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = task.body.as_ref().filter(|b| !b.is_empty()) {
            builder = builder.body(body.clone());
        }

        builder
            .build()
            .map_err(|e| TaskError::unrecoverable(format!("Couldn't create request: {}", e)))
    }
}

fn build_headers(task: &HttpTask) -> Result<HeaderMap, TaskError> {
    let mut headers = HeaderMap::with_capacity(task.headers.len());

    for (name, value) in &task.headers {
        let value = value.as_str().ok_or_else(|| {
            TaskError::unrecoverable(format!(
                "Invalid header {}, all headers must be of the type string",
                name
            ))
        })?;

        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TaskError::unrecoverable(format!("Invalid header name {}: {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            TaskError::unrecoverable(format!("Invalid value for header {}: {}", name, e))
        })?;

        headers.insert(name, value);
    }

    Ok(headers)
}

#[async_trait]
impl HttpExecutor for WebhookExecutor {
    async fn execute(&self, task: &HttpTask) -> Result<(), TaskError> {
        info!("Sending {} {}", task.method, task.url);

        let request = self.build_request(task).map_err(|e| {
            error!("Couldn't create request: {}", e.message);
            e
        })?;

        let response = self.client.execute(request).await.map_err(|e| {
            error!("An error occurred when sending the request: {}", e);
            TaskError::recoverable(format!("Request to {} failed: {}", task.url, e))
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            error!("Server returned status: {}", status);
            return Err(TaskError::recoverable(format!(
                "{} {} returned {}",
                task.method, task.url, status
            )));
        }

        debug!("{} {} returned {}", task.method, task.url, status);
        Ok(())
    }
}
