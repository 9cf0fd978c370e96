use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::warehouse::{JobSummary, QueryJob, TableData, TableRef, Warehouse, WarehouseError};
use crate::config::WarehouseSettings;

/// BigQuery REST v2 client (`jobs.query` + `jobs.getQueryResults`).
#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    client: Client,
    endpoint: String,
    project_id: String,
    access_token: Option<String>,
    query_wait_ms: u64,
    max_polls: u32,
}

impl BigQueryWarehouse {
    /// Builds a client from warehouse settings and an optional OAuth token.
    pub fn new(
        settings: &WarehouseSettings,
        access_token: Option<String>,
    ) -> Result<Self, WarehouseError> {
        let client = Client::builder()
            .user_agent("bikes-duration-pipeline/0.1")
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|err| WarehouseError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            project_id: settings.project_id.clone(),
            access_token,
            query_wait_ms: settings.query_wait_ms,
            max_polls: settings.max_polls.max(1),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<QueryResponse, WarehouseError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| WarehouseError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| WarehouseError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|err| WarehouseError::Decode(err.to_string()))
    }

    async fn start(&self, job: &QueryJob) -> Result<QueryResponse, WarehouseError> {
        let url = format!("{}/projects/{}/queries", self.endpoint, self.project_id);
        let body = json!({
            "query": job.sql,
            "useLegacySql": job.use_legacy_sql,
            "location": job.location,
            "timeoutMs": self.query_wait_ms,
        });
        self.send(self.client.post(url).json(&body)).await
    }

    async fn results(
        &self,
        job: &JobReference,
        location: &str,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.endpoint, self.project_id, job.job_id
        );
        let location = job.location.as_deref().unwrap_or(location);
        let mut query = vec![
            ("location", location.to_string()),
            ("timeoutMs", self.query_wait_ms.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.send(self.client.get(url).query(&query)).await
    }

    /// Runs a job and waits for completion; returns the first result page.
    async fn run_to_completion(
        &self,
        job: &QueryJob,
    ) -> Result<(JobReference, QueryResponse), WarehouseError> {
        let mut response = self.start(job).await?;
        let reference = response
            .job_reference
            .clone()
            .ok_or_else(|| WarehouseError::Decode("response has no jobReference".into()))?;
        let mut polls = 0;
        while !response.job_complete {
            if polls >= self.max_polls {
                return Err(WarehouseError::Timeout {
                    job_id: reference.job_id,
                    polls,
                });
            }
            polls += 1;
            response = self.results(&reference, &job.location, None).await?;
        }
        Ok((reference, response))
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn execute(&self, job: &QueryJob) -> Result<JobSummary, WarehouseError> {
        let (reference, _) = self.run_to_completion(job).await?;
        Ok(JobSummary {
            job_id: Some(reference.job_id),
        })
    }

    async fn read_table(
        &self,
        table: &TableRef,
        location: &str,
    ) -> Result<TableData, WarehouseError> {
        let job = QueryJob::standard(format!("SELECT * FROM {table}"), location);
        let (reference, first) = self.run_to_completion(&job).await?;
        let schema = first
            .schema
            .clone()
            .ok_or_else(|| WarehouseError::Decode("completed query has no schema".into()))?;
        let mut data = decode_rows(&schema, first.rows)?;
        let mut page_token = first.page_token;
        while let Some(token) = page_token {
            let page = self.results(&reference, location, Some(&token)).await?;
            data.rows.extend(decode_rows(&schema, page.rows)?.rows);
            page_token = page.page_token;
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Row {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Clone, Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

fn decode_rows(schema: &TableSchema, rows: Vec<Row>) -> Result<TableData, WarehouseError> {
    let columns: Vec<String> = schema.fields.iter().map(|field| field.name.clone()).collect();
    let mut decoded = Vec::with_capacity(rows.len());
    for (idx, row) in rows.into_iter().enumerate() {
        if row.f.len() != columns.len() {
            return Err(WarehouseError::Decode(format!(
                "row {idx} has {} cells, schema has {} fields",
                row.f.len(),
                columns.len()
            )));
        }
        decoded.push(row.f.into_iter().map(|cell| cell.v).collect());
    }
    Ok(TableData::new(columns, decoded))
}

fn api_error(status: StatusCode, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.chars().take(512).collect());
    if status == StatusCode::NOT_FOUND {
        WarehouseError::NotFound(message)
    } else {
        WarehouseError::Query(format!("{status}: {message}"))
    }
}
