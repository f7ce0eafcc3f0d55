use serde::{Deserialize, Serialize};
use std::path::Path;

use super::ServiceContext;
use crate::error::{Error, Result};
use crate::postgrest::SortOrder;
use crate::storage::FileOptions;

pub const REPORTS_TABLE: &str = "reports";
pub const REPORTS_BUCKET: &str = "medical_files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Normal,
    Attention,
    Critical,
}

/// Row of the `reports` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub report_type: String,
    pub date: String,
    pub provider: String,
    pub status: ReportStatus,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReport {
    pub title: String,
    #[serde(rename = "type")]
    pub report_type: String,
    pub date: String,
    pub provider: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A file attached to a report
#[derive(Debug, Clone)]
pub struct ReportFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl ReportFile {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            bytes,
            content_type: None,
        }
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
    }

    /// Object path of this file for `report_id`
    pub fn storage_path(&self, report_id: &str) -> String {
        match self.extension() {
            Some(ext) => format!("reports/{}.{}", report_id, ext),
            None => format!("reports/{}", report_id),
        }
    }
}

#[derive(Serialize)]
struct FilePathUpdate<'a> {
    file_path: &'a str,
}

/// Medical reports and their attached files
#[derive(Clone)]
pub struct ReportService {
    ctx: ServiceContext,
}

impl ReportService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn fail<T>(&self, message: &str, error: Error) -> Result<T> {
        log::error!("{}: {}", message, error);
        self.ctx.notifications().error(message);
        Err(error)
    }

    /// All reports visible to the user, newest first
    pub async fn list(&self) -> Result<Vec<Report>> {
        let result = self
            .ctx
            .table(REPORTS_TABLE)
            .select("*")
            .order("created_at", SortOrder::Descending)
            .execute::<Report>()
            .await;
        match result {
            Ok(reports) => Ok(reports),
            Err(e) => self.fail("Failed to load reports", e),
        }
    }

    /// Insert a report and upload its file, if any
    pub async fn create(&self, report: NewReport, file: Option<ReportFile>) -> Result<Report> {
        match self.try_create(report, file).await {
            Ok(report) => {
                self.ctx.notifications().success("Report created successfully");
                Ok(report)
            }
            Err(e) => self.fail("Failed to create report", e),
        }
    }

    async fn try_create(&self, mut report: NewReport, file: Option<ReportFile>) -> Result<Report> {
        if report.title.trim().is_empty() {
            return Err(Error::validation("Report title is required"));
        }
        if report.user_id.is_none() {
            report.user_id = self.ctx.user_id();
        }

        let rows: Vec<Report> = self.ctx.table(REPORTS_TABLE).insert(&[&report]).await?;
        let mut created = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::database("Insert returned no report"))?;

        let file = match file {
            Some(file) => file,
            None => return Ok(created),
        };
        // An upload failure is already reported; the row stays without a file
        match self.upload_file(&file, &created.id).await {
            Ok(path) => {
                let _: Vec<Report> = self
                    .ctx
                    .table(REPORTS_TABLE)
                    .eq("id", &created.id)
                    .update(&FilePathUpdate { file_path: &path })
                    .await?;
                created.file_path = Some(path);
            }
            Err(e) => log::warn!("Report {} saved without its file: {}", created.id, e),
        }
        Ok(created)
    }

    /// Store `file` for `report_id`, replacing any earlier upload. Returns the object path.
    pub async fn upload_file(&self, file: &ReportFile, report_id: &str) -> Result<String> {
        let path = file.storage_path(report_id);
        let mut options = FileOptions::default()
            .with_cache_control(3600)
            .with_upsert(true);
        if let Some(content_type) = &file.content_type {
            options = options.with_content_type(content_type);
        }

        let storage = self.ctx.storage();
        match storage
            .from(REPORTS_BUCKET)
            .upload(&path, file.bytes.clone(), options)
            .await
        {
            Ok(_) => Ok(path),
            Err(e) => self.fail("Failed to upload file", e),
        }
    }

    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let storage = self.ctx.storage();
        match storage.from(REPORTS_BUCKET).download(file_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => self.fail("Failed to download file", e),
        }
    }

    /// Remove the stored file, then the row
    pub async fn delete(&self, report: &Report) -> Result<()> {
        let result = async {
            if let Some(path) = &report.file_path {
                self.ctx
                    .storage()
                    .from(REPORTS_BUCKET)
                    .remove(&[path.as_str()])
                    .await?;
            }
            self.ctx
                .table(REPORTS_TABLE)
                .eq("id", &report.id)
                .delete()
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.ctx.notifications().success("Report deleted");
                Ok(())
            }
            Err(e) => self.fail("Failed to delete report", e),
        }
    }
}
