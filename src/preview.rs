use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::AdminGateway;
use crate::errors::{AppError, AppResult};
use crate::models::{CompanyRecord, RouteRecord};

pub const STATUS_READY: &str = "Ready to import";
pub const STATUS_COMPLETE: &str = "Import complete";
pub const STATUS_COMMIT_FAILED: &str = "Failed to import selected rows";
pub const STATUS_NO_RECORDS: &str = "No records found";

#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry<R> {
    pub record: R,
    pub included: bool,
}

/// Parsed records waiting for the operator's opt-out. Indices are stable.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewBatch<R> {
    entries: Vec<PreviewEntry<R>>,
}

impl<R> PreviewBatch<R> {
    /// Every record starts included.
    pub fn new(records: Vec<R>) -> Self {
        Self {
            entries: records
                .into_iter()
                .map(|record| PreviewEntry {
                    record,
                    included: true,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PreviewEntry<R>] {
        &self.entries
    }

    /// Flips one row and returns its new state; `None` for an unknown index.
    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        let entry = self.entries.get_mut(index)?;
        entry.included = !entry.included;
        Some(entry.included)
    }

    pub fn set_included(&mut self, index: usize, included: bool) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.included = included;
                true
            }
            None => false,
        }
    }

    pub fn select_all(&mut self, included: bool) {
        for entry in &mut self.entries {
            entry.included = included;
        }
    }

    pub fn included_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.included).count()
    }

    pub fn included(&self) -> impl Iterator<Item = (usize, &R)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.included)
            .map(|(index, entry)| (index, &entry.record))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Built,
    Dropped { reason: String },
    Created,
    Rejected { reason: String },
}

/// What happened to one source row, at parse time or at commit time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowOutcome {
    pub index: usize,
    pub outcome: Outcome,
}

/// Status line shown after parsing.
pub fn parse_status(outcomes: &[RowOutcome]) -> String {
    let built = outcomes
        .iter()
        .filter(|row| row.outcome == Outcome::Built)
        .count();
    let dropped: Vec<&str> = outcomes
        .iter()
        .filter_map(|row| match &row.outcome {
            Outcome::Dropped { reason } => Some(reason.as_str()),
            _ => None,
        })
        .collect();

    match (built, dropped.last()) {
        (0, Some(reason)) => (*reason).to_string(),
        (0, None) => STATUS_NO_RECORDS.to_string(),
        (_, None) => STATUS_READY.to_string(),
        (_, Some(_)) => format!("{STATUS_READY} ({} skipped)", dropped.len()),
    }
}

pub fn progress_message(imported: usize, total: usize) -> String {
    format!("Imported {imported}/{total}")
}

/// A canonical record that knows which create call submits it.
#[async_trait]
pub trait Importable: Send + Sync {
    async fn submit(&self, gateway: &dyn AdminGateway) -> AppResult<()>;
}

#[async_trait]
impl Importable for RouteRecord {
    async fn submit(&self, gateway: &dyn AdminGateway) -> AppResult<()> {
        gateway.create_ruta(self).await
    }
}

#[async_trait]
impl Importable for CompanyRecord {
    async fn submit(&self, gateway: &dyn AdminGateway) -> AppResult<()> {
        gateway.create_empresa(self).await
    }
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, imported: usize, total: usize);
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_progress(&self, imported: usize, total: usize) {
        self(imported, total)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub outcomes: Vec<RowOutcome>,
    pub imported: usize,
    /// Included rows when the commit started.
    pub total: usize,
    /// Set when a transport failure stopped the loop early.
    pub aborted: Option<String>,
}

impl CommitReport {
    pub fn status(&self) -> &'static str {
        if self.aborted.is_some() {
            STATUS_COMMIT_FAILED
        } else {
            STATUS_COMPLETE
        }
    }

    pub fn rejected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|row| matches!(row.outcome, Outcome::Rejected { .. }))
            .count()
    }
}

/// Submits included rows one at a time, in index order.
pub struct BatchCommitter<'a> {
    gateway: &'a dyn AdminGateway,
}

impl<'a> BatchCommitter<'a> {
    pub fn new(gateway: &'a dyn AdminGateway) -> Self {
        Self { gateway }
    }

    /// A rejected row is recorded and skipped; a transport failure ends the loop.
    pub async fn commit<R: Importable>(
        &self,
        batch: &PreviewBatch<R>,
        observer: &dyn ProgressObserver,
    ) -> CommitReport {
        let total = batch.included_count();
        let mut report = CommitReport {
            outcomes: Vec::with_capacity(total),
            imported: 0,
            total,
            aborted: None,
        };

        for (index, record) in batch.included() {
            match record.submit(self.gateway).await {
                Ok(()) => {
                    report.imported += 1;
                    report.outcomes.push(RowOutcome {
                        index,
                        outcome: Outcome::Created,
                    });
                }
                Err(err) if err.is_transport() || err.is_cancelled() => {
                    warn!(target: "import", index, ?err, "commit stopped by transport failure");
                    report.aborted = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    warn!(target: "import", index, ?err, "row rejected by backend");
                    report.outcomes.push(RowOutcome {
                        index,
                        outcome: Outcome::Rejected {
                            reason: rejection_reason(&err),
                        },
                    });
                }
            }
            observer.on_progress(report.imported, total);
        }

        info!(
            target: "import",
            imported = report.imported,
            rejected = report.rejected(),
            total,
            aborted = report.aborted.is_some(),
            "batch commit finished"
        );
        report
    }
}

fn rejection_reason(err: &AppError) -> String {
    match err {
        AppError::Api { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmpresaAdmin, RutaAdmin};
    use parking_lot::Mutex;

    struct ScriptedGateway {
        created: Mutex<Vec<String>>,
        reject: Vec<&'static str>,
        drop_connection_at: Option<&'static str>,
    }

    impl ScriptedGateway {
        fn new(reject: Vec<&'static str>, drop_connection_at: Option<&'static str>) -> Self {
            Self {
                created: Mutex::new(Vec::new()),
                reject,
                drop_connection_at,
            }
        }
    }

    #[async_trait]
    impl AdminGateway for ScriptedGateway {
        async fn create_ruta(&self, _record: &RouteRecord) -> AppResult<()> {
            unreachable!("routes are not used here")
        }

        async fn create_empresa(&self, record: &CompanyRecord) -> AppResult<()> {
            if self.drop_connection_at == Some(record.nombre.as_str()) {
                return Err(AppError::Timeout);
            }
            if self.reject.iter().any(|name| *name == record.nombre) {
                return Err(AppError::Api {
                    status: 409,
                    message: "duplicate".into(),
                });
            }
            self.created.lock().push(record.nombre.clone());
            Ok(())
        }

        async fn list_rutas(&self) -> AppResult<Vec<RutaAdmin>> {
            Ok(Vec::new())
        }

        async fn list_empresas(&self) -> AppResult<Vec<EmpresaAdmin>> {
            Ok(Vec::new())
        }
    }

    fn company(nombre: &str) -> CompanyRecord {
        CompanyRecord {
            nombre: nombre.into(),
            municipio_id: "m1".into(),
            telefono: None,
            email: None,
            activa: true,
            municipio_label: "Huamantla".into(),
        }
    }

    fn batch(names: &[&str]) -> PreviewBatch<CompanyRecord> {
        PreviewBatch::new(names.iter().map(|name| company(name)).collect())
    }

    #[test]
    fn new_batches_include_everything() {
        let mut batch = batch(&["a", "b", "c"]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.included_count(), 3);
        assert_eq!(batch.toggle(1), Some(false));
        assert_eq!(batch.toggle(7), None);
        assert_eq!(batch.included().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 2]);
        batch.select_all(false);
        assert_eq!(batch.included_count(), 0);
        assert!(batch.set_included(2, true));
        assert!(!batch.set_included(3, true));
    }

    #[tokio::test]
    async fn rejected_row_does_not_block_the_rest() {
        let gateway = ScriptedGateway::new(vec!["b"], None);
        let progress = Mutex::new(Vec::new());
        let observer = |imported: usize, total: usize| progress.lock().push(progress_message(imported, total));

        let report = BatchCommitter::new(&gateway)
            .commit(&batch(&["a", "b", "c"]), &observer)
            .await;

        assert_eq!(*gateway.created.lock(), vec!["a", "c"]);
        assert_eq!(report.imported, 2);
        assert_eq!(report.rejected(), 1);
        assert_eq!(report.status(), STATUS_COMPLETE);
        assert_eq!(
            report.outcomes[1],
            RowOutcome {
                index: 1,
                outcome: Outcome::Rejected {
                    reason: "duplicate".into()
                }
            }
        );
        assert_eq!(
            *progress.lock(),
            vec!["Imported 1/3", "Imported 1/3", "Imported 2/3"]
        );
    }

    #[tokio::test]
    async fn transport_failure_stops_remaining_rows() {
        let gateway = ScriptedGateway::new(Vec::new(), Some("b"));
        let report = BatchCommitter::new(&gateway)
            .commit(&batch(&["a", "b", "c"]), &|_: usize, _: usize| {})
            .await;

        assert_eq!(*gateway.created.lock(), vec!["a"]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].outcome, Outcome::Created);
        assert_eq!(report.status(), STATUS_COMMIT_FAILED);
    }

    #[tokio::test]
    async fn excluded_rows_are_skipped_and_total_is_fixed_at_start() {
        let gateway = ScriptedGateway::new(Vec::new(), None);
        let mut pending = batch(&["a", "b", "c"]);
        pending.toggle(0);
        let report = BatchCommitter::new(&gateway)
            .commit(&pending, &|_: usize, _: usize| {})
            .await;
        assert_eq!(report.total, 2);
        assert_eq!(
            report.outcomes.iter().map(|o| o.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn parse_status_prefers_last_drop_reason_when_nothing_built() {
        let dropped = |index, reason: &str| RowOutcome {
            index,
            outcome: Outcome::Dropped {
                reason: reason.into(),
            },
        };
        let built = |index| RowOutcome {
            index,
            outcome: Outcome::Built,
        };

        assert_eq!(
            parse_status(&[dropped(0, "Company not found"), dropped(1, "Municipality not found")]),
            "Municipality not found"
        );
        assert_eq!(parse_status(&[]), STATUS_NO_RECORDS);
        assert_eq!(parse_status(&[built(0), built(1)]), STATUS_READY);
        assert_eq!(
            parse_status(&[built(0), dropped(1, "Company not found")]),
            "Ready to import (1 skipped)"
        );
    }
}
