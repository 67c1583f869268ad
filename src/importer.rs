use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::backend::AdminGateway;
use crate::errors::{AppError, AppResult, ReferenceKind};
use crate::ingestion::{ImportSource, RawCompany, RawRecord, RawRoute};
use crate::models::{CompanyRecord, EmpresaAdmin, RouteRecord, RutaAdmin};
use crate::payload::PayloadBuilder;
use crate::preview::{
    parse_status, BatchCommitter, CommitReport, Importable, Outcome, PreviewBatch,
    ProgressObserver, RowOutcome, STATUS_COMMIT_FAILED,
};
use crate::telemetry::{TelemetryClient, TelemetryKind};

pub const STATUS_UNSUPPORTED: &str = "Unsupported format";
pub const STATUS_INVALID_FILE: &str = "Invalid file or import error";

/// What a session imports: the raw row shape, the canonical record, and the
/// authoritative list re-fetched after a commit.
#[async_trait]
pub trait ImportKind: Send + Sync + 'static {
    type Raw: RawRecord + Send + Sync;
    type Record: Importable + Clone + Serialize;
    type Listing: Send;

    const LABEL: &'static str;

    async fn build(builder: &PayloadBuilder, raw: &Self::Raw) -> AppResult<Self::Record>;
    async fn refetch(gateway: &dyn AdminGateway) -> AppResult<Self::Listing>;
}

pub struct Routes;

#[async_trait]
impl ImportKind for Routes {
    type Raw = RawRoute;
    type Record = RouteRecord;
    type Listing = Vec<RutaAdmin>;

    const LABEL: &'static str = "routes";

    async fn build(builder: &PayloadBuilder, raw: &RawRoute) -> AppResult<RouteRecord> {
        builder.build_route(raw).await
    }

    async fn refetch(gateway: &dyn AdminGateway) -> AppResult<Vec<RutaAdmin>> {
        gateway.list_rutas().await
    }
}

pub struct Companies;

#[async_trait]
impl ImportKind for Companies {
    type Raw = RawCompany;
    type Record = CompanyRecord;
    type Listing = Vec<EmpresaAdmin>;

    const LABEL: &'static str = "companies";

    async fn build(builder: &PayloadBuilder, raw: &RawCompany) -> AppResult<CompanyRecord> {
        Ok(builder.build_company(raw).await)
    }

    async fn refetch(gateway: &dyn AdminGateway) -> AppResult<Vec<EmpresaAdmin>> {
        gateway.list_empresas().await
    }
}

pub type RouteImporter = ImportSession<Routes>;
pub type CompanyImporter = ImportSession<Companies>;

/// One import dialog: parse a file into a preview batch, let the operator
/// opt rows out, then commit what is left.
pub struct ImportSession<K: ImportKind> {
    builder: PayloadBuilder,
    gateway: Arc<dyn AdminGateway>,
    telemetry: Option<TelemetryClient>,
    file_name: Option<String>,
    batch: Option<PreviewBatch<K::Record>>,
    parse_outcomes: Vec<RowOutcome>,
    commit_report: Option<CommitReport>,
    listing: Option<K::Listing>,
    status: Option<String>,
}

impl<K: ImportKind> ImportSession<K> {
    pub fn new(builder: PayloadBuilder, gateway: Arc<dyn AdminGateway>) -> Self {
        Self {
            builder,
            gateway,
            telemetry: None,
            file_name: None,
            batch: None,
            parse_outcomes: Vec::new(),
            commit_report: None,
            listing: None,
            status: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Detects the format from the name before touching the file.
    pub async fn process_path(&mut self, path: &Path) -> Option<&str> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.reset(Some(file_name.clone()));
        let source = match ImportSource::detect(&file_name) {
            Ok(source) => source,
            Err(err) => return self.fail(err),
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => self.ingest(source, &bytes).await,
            Err(err) => self.fail(AppError::Io(err)),
        }
    }

    /// Replaces any previous batch, all or nothing.
    pub async fn process_file(&mut self, file_name: &str, bytes: &[u8]) -> Option<&str> {
        self.reset(Some(file_name.to_string()));
        match ImportSource::detect(file_name) {
            Ok(source) => self.ingest(source, bytes).await,
            Err(err) => self.fail(err),
        }
    }

    async fn ingest(&mut self, source: ImportSource, bytes: &[u8]) -> Option<&str> {
        let raws: Vec<K::Raw> = match source.parse(bytes) {
            Ok(raws) => raws,
            Err(err) => return self.fail(err),
        };

        let mut records = Vec::with_capacity(raws.len());
        let mut outcomes = Vec::with_capacity(raws.len());
        for (index, raw) in raws.iter().enumerate() {
            let outcome = match K::build(&self.builder, raw).await {
                Ok(record) => {
                    records.push(record);
                    Outcome::Built
                }
                Err(err) => {
                    warn!(target: "import", kind = K::LABEL, index, ?err, "row dropped");
                    Outcome::Dropped {
                        reason: drop_reason(&err),
                    }
                }
            };
            outcomes.push(RowOutcome { index, outcome });
        }

        let built = records.len();
        let dropped = outcomes.len() - built;
        if built > 0 {
            self.batch = Some(PreviewBatch::new(records));
        }
        self.status = Some(parse_status(&outcomes));
        self.parse_outcomes = outcomes;

        info!(
            target: "import",
            kind = K::LABEL,
            format = source.as_tag(),
            built,
            dropped,
            "import file processed"
        );
        self.record_event(
            TelemetryKind::ImportParsed,
            json!({
                "kind": K::LABEL,
                "format": source.as_tag(),
                "built": built,
                "dropped": dropped,
            }),
        );
        self.status.as_deref()
    }

    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        self.batch.as_mut()?.toggle(index)
    }

    pub fn select_all(&mut self, included: bool) {
        if let Some(batch) = self.batch.as_mut() {
            batch.select_all(included);
        }
    }

    /// Commits the included rows, then re-fetches the authoritative list.
    /// `None` when there is no batch to commit.
    pub async fn commit(&mut self, observer: &dyn ProgressObserver) -> Option<&CommitReport> {
        let batch = self.batch.as_ref()?;
        let report = BatchCommitter::new(self.gateway.as_ref())
            .commit(batch, observer)
            .await;

        let status = if report.aborted.is_some() {
            STATUS_COMMIT_FAILED.to_string()
        } else {
            match K::refetch(self.gateway.as_ref()).await {
                Ok(listing) => {
                    self.listing = Some(listing);
                    report.status().to_string()
                }
                Err(err) => {
                    warn!(target: "import", kind = K::LABEL, ?err, "refetch after commit failed");
                    STATUS_COMMIT_FAILED.to_string()
                }
            }
        };

        self.record_event(
            TelemetryKind::ImportCommitted,
            json!({
                "kind": K::LABEL,
                "imported": report.imported,
                "rejected": report.rejected(),
                "total": report.total,
                "aborted": report.aborted.is_some(),
            }),
        );
        self.status = Some(status);
        self.commit_report = Some(report);
        self.commit_report.as_ref()
    }

    /// Dialog closed: everything goes.
    pub fn close(&mut self) {
        self.reset(None);
    }

    pub fn batch(&self) -> Option<&PreviewBatch<K::Record>> {
        self.batch.as_ref()
    }

    pub fn parse_outcomes(&self) -> &[RowOutcome] {
        &self.parse_outcomes
    }

    pub fn commit_report(&self) -> Option<&CommitReport> {
        self.commit_report.as_ref()
    }

    pub fn listing(&self) -> Option<&K::Listing> {
        self.listing.as_ref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn reset(&mut self, file_name: Option<String>) {
        self.file_name = file_name;
        self.batch = None;
        self.parse_outcomes.clear();
        self.commit_report = None;
        self.listing = None;
        self.status = None;
    }

    fn fail(&mut self, err: AppError) -> Option<&str> {
        let status = match err {
            AppError::UnsupportedFormat(_) => STATUS_UNSUPPORTED,
            _ => STATUS_INVALID_FILE,
        };
        warn!(target: "import", kind = K::LABEL, ?err, status, "import file rejected");
        self.status = Some(status.to_string());
        self.status.as_deref()
    }

    fn record_event(&self, kind: TelemetryKind, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record(kind, payload) {
                warn!(target: "import", ?err, "failed to queue telemetry event");
            }
        }
    }
}

fn drop_reason(err: &AppError) -> String {
    match err {
        AppError::UnresolvedReference {
            kind: ReferenceKind::Municipality,
            ..
        } => "Municipality not found".to_string(),
        AppError::UnresolvedReference {
            kind: ReferenceKind::Company,
            ..
        } => "Company not found".to_string(),
        other => other.to_string(),
    }
}
