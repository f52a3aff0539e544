//! DocumentCloud REST implementation of every platform collaborator.
//!
//! Endpoints used (relative to the API root, bearer-token auth):
//!
//! | Collaborator | Call |
//! |---|---|
//! | documents | `GET documents/{id}/` |
//! | credits   | `POST organizations/{org}/ai_credits/`, 400 ⇒ insufficient |
//! | upload    | `GET addon_runs/{run}/?upload_file=…` → presigned `PUT` → `PATCH addon_runs/{run}/` |
//! | message   | `PATCH addon_runs/{run}/` |
//!
//! Without a run id there is nothing to report to; messages are logged only.

use crate::error::PlatformError;
use crate::platform::{CreditLedger, DocumentSource, RunReporter, SourceDocument, Uploader};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.www.documentcloud.org/api/";

const HTTP_TIMEOUT_SECS: u64 = 60;

/// A document record as returned by `GET documents/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudDocument {
    pub id: String,
    pub slug: String,
    pub page_count: u32,
    pub asset_url: String,
}

#[derive(Debug, Deserialize)]
struct DocumentRecord {
    id: Value,
    slug: String,
    page_count: u32,
    asset_url: String,
}

impl From<DocumentRecord> for CloudDocument {
    fn from(r: DocumentRecord) -> Self {
        let id = match r.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Self {
            id,
            slug: r.slug,
            page_count: r.page_count,
            asset_url: r.asset_url,
        }
    }
}

impl SourceDocument for CloudDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn large_image_url(&self, page: u32) -> String {
        format!(
            "{}/documents/{}/pages/{}-p{}-large.gif",
            self.asset_url.trim_end_matches('/'),
            self.id,
            self.slug,
            page
        )
    }
}

#[derive(Debug, Deserialize)]
struct PresignedUpload {
    presigned_url: String,
}

/// Authenticated client for one add-on run.
#[derive(Debug, Clone)]
pub struct DocumentCloudClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    organization: Option<String>,
    run_id: Option<String>,
}

impl DocumentCloudClient {
    /// `api_url` is the API root; a missing trailing slash is added.
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self, PlatformError> {
        let root = if api_url.ends_with('/') {
            api_url.to_string()
        } else {
            format!("{api_url}/")
        };
        let base = Url::parse(&root)
            .map_err(|e| PlatformError::Decode(format!("invalid API URL '{api_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base,
            token: token.filter(|t| !t.is_empty()),
            organization: None,
            run_id: None,
        })
    }

    /// Organization billed for the run.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into()).filter(|o: &String| !o.is_empty());
        self
    }

    /// Add-on run that receives messages and the upload.
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into()).filter(|r: &String| !r.is_empty());
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlatformError> {
        self.base
            .join(path)
            .map_err(|e| PlatformError::Decode(format!("invalid endpoint '{path}': {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn run_endpoint(&self) -> Result<Url, PlatformError> {
        let run = self.run_id.as_deref().ok_or_else(|| PlatformError::NotFound {
            resource: "add-on run".to_string(),
        })?;
        self.endpoint(&format!("addon_runs/{run}/"))
    }

    async fn patch_run(&self, body: Value) -> Result<(), PlatformError> {
        let url = self.run_endpoint()?;
        let response = self.request(Method::PATCH, url).json(&body).send().await?;
        check(response, "add-on run").await?;
        Ok(())
    }
}

/// Map non-success statuses to [`PlatformError`].
async fn check(response: Response, resource: &str) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(PlatformError::NotFound {
            resource: resource.to_string(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DocumentSource for DocumentCloudClient {
    async fn fetch_document(&self, id: &str) -> Result<Arc<dyn SourceDocument>, PlatformError> {
        let url = self.endpoint(&format!("documents/{id}/"))?;
        let response = self.request(Method::GET, url).send().await?;
        let record: DocumentRecord = check(response, &format!("document {id}"))
            .await?
            .json()
            .await?;
        let document = CloudDocument::from(record);
        debug!(
            "Fetched document {} ({} pages)",
            document.id, document.page_count
        );
        Ok(Arc::new(document))
    }
}

#[async_trait]
impl CreditLedger for DocumentCloudClient {
    fn has_organization(&self) -> bool {
        self.organization.is_some()
    }

    async fn charge(&self, credits: u64) -> Result<(), PlatformError> {
        let org = self
            .organization
            .as_deref()
            .ok_or_else(|| PlatformError::NotFound {
                resource: "organization".to_string(),
            })?;
        let url = self.endpoint(&format!("organizations/{org}/ai_credits/"))?;
        let mut body = json!({ "ai_credits": credits });
        if let Some(ref run) = self.run_id {
            body["addonrun_id"] = json!(run);
        }

        let response = self.request(Method::POST, url).json(&body).send().await?;
        if response.status() == StatusCode::BAD_REQUEST {
            return Err(PlatformError::InsufficientCredits);
        }
        check(response, &format!("organization {org}")).await?;
        info!("Charged {} AI credits to organization {}", credits, org);
        Ok(())
    }
}

#[async_trait]
impl Uploader for DocumentCloudClient {
    async fn upload(&self, archive: &Path) -> Result<(), PlatformError> {
        let name = archive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PlatformError::Decode(format!("invalid archive path {}", archive.display())))?
            .to_string();

        let url = self.run_endpoint()?;
        let response = self
            .request(Method::GET, url)
            .query(&[("upload_file", name.as_str())])
            .send()
            .await?;
        let presigned: PresignedUpload = check(response, "add-on run").await?.json().await?;

        let bytes = tokio::fs::read(archive).await?;
        let size = bytes.len();
        let response = self
            .http
            .put(presigned.presigned_url.as_str())
            .body(bytes)
            .send()
            .await?;
        check(response, "upload target").await?;

        self.patch_run(json!({ "file_name": name })).await?;
        info!("Uploaded {} ({} bytes)", name, size);
        Ok(())
    }
}

#[async_trait]
impl RunReporter for DocumentCloudClient {
    async fn set_message(&self, message: &str) -> Result<(), PlatformError> {
        info!("{}", message);
        if self.run_id.is_none() {
            return Ok(());
        }
        self.patch_run(json!({ "message": message })).await
    }
}
