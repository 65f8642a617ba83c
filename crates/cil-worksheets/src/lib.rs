use cil_core::worksheet_contracts::{
    partition_batches, Batch, BatchLimits, ContractError, CriterionAxis, CriterionConstraint,
    Grouping, ResetScope,
};
use cil_storage::{EligibilityFilter, RecordStore, StorageError};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod config;
pub mod snapshot;

pub use config::WorksheetConfig;

#[derive(Debug, Error)]
pub enum WorksheetError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("criterion axis cannot be resolved: {0}")]
    ConstraintUnresolvable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),
}

impl From<ContractError> for WorksheetError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::UnknownCriterionAxis(axis) => {
                WorksheetError::ConstraintUnresolvable(axis)
            }
            other => WorksheetError::InvalidRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub rows_loaded: usize,
    pub skipped_rows: usize,
    pub preserved_claims: usize,
    pub delimiter: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub grouping: Grouping,
    pub limits: BatchLimits,
    pub criterion: Option<CriterionConstraint>,
}

impl GenerationRequest {
    pub fn new(grouping: Grouping, limits: BatchLimits) -> Self {
        Self {
            grouping,
            limits,
            criterion: None,
        }
    }

    pub fn with_criterion(mut self, criterion: CriterionConstraint) -> Self {
        self.criterion = Some(criterion);
        self
    }

    /// Builds a request from loosely typed operator input. An axis name that
    /// is not in the closed set fails with `ConstraintUnresolvable` even when
    /// no value accompanies it; an axis with a blank value means "no
    /// constraint".
    pub fn from_operator_input(
        grouping: Grouping,
        limits: BatchLimits,
        criterion_axis: Option<&str>,
        criterion_value: Option<&str>,
    ) -> Result<Self, WorksheetError> {
        let axis = criterion_axis
            .filter(|axis| !axis.trim().is_empty())
            .map(str::parse::<CriterionAxis>)
            .transpose()?;
        let value = criterion_value.filter(|value| !value.trim().is_empty());

        let criterion = match (axis, value) {
            (Some(axis), Some(value)) => Some(CriterionConstraint::new(axis, value)?),
            (Some(_), None) => None,
            (None, Some(_)) => {
                return Err(WorksheetError::InvalidRequest(
                    "criterion value given without an axis".to_string(),
                ))
            }
            (None, None) => None,
        };

        Ok(Self {
            grouping,
            limits,
            criterion,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedBatches {
    pub batches: Vec<Batch>,
    /// Supplied identifiers that matched no eligible record.
    pub unmatched_identifiers: Vec<String>,
    /// Rows transitioned to claimed, as counted by the store at commit time.
    pub rows_claimed: usize,
    pub nibs_claimed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Generated(GeneratedBatches),
    NothingEligible { unmatched_identifiers: Vec<String> },
}

impl GenerationOutcome {
    pub fn batches(&self) -> &[Batch] {
        match self {
            GenerationOutcome::Generated(generated) => &generated.batches,
            GenerationOutcome::NothingEligible { .. } => &[],
        }
    }

    pub fn unmatched_identifiers(&self) -> &[String] {
        match self {
            GenerationOutcome::Generated(generated) => &generated.unmatched_identifiers,
            GenerationOutcome::NothingEligible {
                unmatched_identifiers,
            } => unmatched_identifiers,
        }
    }

    pub fn rows_claimed(&self) -> usize {
        match self {
            GenerationOutcome::Generated(generated) => generated.rows_claimed,
            GenerationOutcome::NothingEligible { .. } => 0,
        }
    }

    pub fn nibs_claimed(&self) -> usize {
        match self {
            GenerationOutcome::Generated(generated) => generated.nibs_claimed,
            GenerationOutcome::NothingEligible { .. } => 0,
        }
    }
}

/// Import, work-sheet generation and claim reset over one request-scoped
/// store connection.
pub struct WorksheetEngine {
    store: RecordStore,
    config: WorksheetConfig,
}

impl WorksheetEngine {
    pub fn new(store: RecordStore, config: WorksheetConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn config(&self) -> &WorksheetConfig {
        &self.config
    }

    /// Replaces the record table with the decoded snapshot. A snapshot that
    /// fails validation leaves the store untouched.
    pub fn import_snapshot(&mut self, bytes: &[u8]) -> Result<ImportReport, WorksheetError> {
        let decoded = snapshot::parse_snapshot(
            bytes,
            self.config.required_columns(),
            self.config.sniff_bytes,
        )?;
        debug!(
            event = "snapshot_decoded",
            rows = decoded.records.len(),
            columns = decoded.column_count,
            delimiter = %char::from(decoded.delimiter)
        );

        let outcome = self.store.replace_with_preserve(&decoded.records)?;
        info!(
            event = "snapshot_imported",
            rows = outcome.rows_loaded,
            skipped = decoded.skipped_rows,
            preserved_claims = outcome.preserved_claims
        );

        Ok(ImportReport {
            rows_loaded: outcome.rows_loaded,
            skipped_rows: decoded.skipped_rows,
            preserved_claims: outcome.preserved_claims,
            delimiter: decoded.delimiter,
        })
    }

    /// Selects eligible records, partitions them into work sheets and claims
    /// every sheet's sub-units in a single transaction. Selection happens
    /// before that transaction, so rows claimed concurrently in between are
    /// skipped. A store failure rolls back every claim of the call.
    pub fn generate_batches(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, WorksheetError> {
        request.limits.validate()?;
        let grouping = request.grouping.normalized()?;
        let filter = EligibilityFilter::new(grouping, request.criterion.clone());

        let eligible = self.store.eligible_records(&filter)?;
        if let Some(criterion) = &filter.criterion {
            debug_assert!(eligible.iter().all(|record| criterion.matches(record)));
        }

        // A record without a nib can never be batched, so it does not count
        // as a match.
        let unmatched_identifiers = match &filter.grouping {
            Grouping::ExplicitList(identifiers) => {
                let found = eligible
                    .iter()
                    .filter(|record| !record.nib_key().is_empty())
                    .map(|record| record.cil.as_str())
                    .collect::<BTreeSet<_>>();
                identifiers
                    .iter()
                    .filter(|identifier| !found.contains(identifier.as_str()))
                    .cloned()
                    .collect::<Vec<_>>()
            }
            _ => Vec::new(),
        };
        if !unmatched_identifiers.is_empty() {
            warn!(
                event = "worksheet_identifiers_unmatched",
                count = unmatched_identifiers.len(),
                identifiers = ?unmatched_identifiers
            );
        }
        let eligible_count = eligible.len();

        let batches = partition_batches(eligible, &request.limits);
        if batches.is_empty() {
            info!(
                event = "worksheets_nothing_eligible",
                mode = %filter.grouping.mode(),
                eligible = eligible_count,
                unmatched = unmatched_identifiers.len()
            );
            return Ok(GenerationOutcome::NothingEligible {
                unmatched_identifiers,
            });
        }

        let nib_batches = batches
            .iter()
            .map(|batch| batch.nibs.clone())
            .collect::<Vec<_>>();
        let outcomes = self.store.claim_batches(&nib_batches, &filter)?;

        let mut rows_claimed = 0;
        let mut nibs_claimed = BTreeSet::new();
        for (batch, outcome) in batches.iter().zip(outcomes) {
            if outcome.rows_claimed != batch.records.len() {
                warn!(
                    event = "worksheet_claim_drift",
                    batch = batch.number,
                    selected = batch.records.len(),
                    claimed = outcome.rows_claimed
                );
            }
            rows_claimed += outcome.rows_claimed;
            nibs_claimed.extend(outcome.nibs_claimed);
        }

        info!(
            event = "worksheets_generated",
            mode = %filter.grouping.mode(),
            batches = batches.len(),
            rows_claimed,
            nibs_claimed = nibs_claimed.len(),
            unmatched = unmatched_identifiers.len()
        );

        Ok(GenerationOutcome::Generated(GeneratedBatches {
            batches,
            unmatched_identifiers,
            rows_claimed,
            nibs_claimed: nibs_claimed.len(),
        }))
    }

    /// Clears claims in `scope`. Irreversible; confirmation is the caller's
    /// job.
    pub fn reset_claims(&mut self, scope: &ResetScope) -> Result<usize, WorksheetError> {
        let scope = scope.normalized()?;
        let affected = self.store.reset_claims(&scope)?;
        info!(event = "claims_reset", scope = scope.as_str(), affected);
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_batches: usize, groups_per_batch: usize) -> BatchLimits {
        BatchLimits {
            max_batches,
            groups_per_batch,
        }
    }

    #[test]
    fn unknown_axis_is_unresolvable_before_any_query() {
        let result = GenerationRequest::from_operator_input(
            Grouping::Pt("ZONE1".to_string()),
            limits(1, 1),
            Some("pt; DELETE FROM records"),
            Some("X"),
        );
        match result {
            Err(WorksheetError::ConstraintUnresolvable(axis)) => {
                assert_eq!(axis, "pt; DELETE FROM records");
            }
            other => panic!("expected unresolvable constraint, got {other:?}"),
        }
    }

    #[test]
    fn operator_input_builds_optional_constraint() {
        let request = GenerationRequest::from_operator_input(
            Grouping::Pt("ZONE1".to_string()),
            limits(1, 1),
            Some("EST_CTR"),
            Some(" ativo "),
        )
        .expect("request");
        assert_eq!(
            request.criterion,
            Some(CriterionConstraint {
                axis: CriterionAxis::EstContr,
                value: "ATIVO".to_string(),
            })
        );

        let without_value = GenerationRequest::from_operator_input(
            Grouping::Pt("ZONE1".to_string()),
            limits(1, 1),
            Some("Criterio"),
            Some("  "),
        )
        .expect("request");
        assert_eq!(without_value.criterion, None);

        assert!(matches!(
            GenerationRequest::from_operator_input(
                Grouping::Pt("ZONE1".to_string()),
                limits(1, 1),
                None,
                Some("FRAUDE"),
            ),
            Err(WorksheetError::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let store = RecordStore::open_in_memory().expect("open db");
        let mut engine = WorksheetEngine::new(store, WorksheetConfig::default());
        let request = GenerationRequest::new(Grouping::Pt("ZONE1".to_string()), limits(0, 5));

        assert!(matches!(
            engine.generate_batches(&request),
            Err(WorksheetError::InvalidRequest(_))
        ));
    }

    #[test]
    fn blank_grouping_value_is_rejected() {
        let store = RecordStore::open_in_memory().expect("open db");
        let mut engine = WorksheetEngine::new(store, WorksheetConfig::default());
        let request = GenerationRequest::new(Grouping::Localidade("  ".to_string()), limits(1, 5));

        match engine.generate_batches(&request) {
            Err(err @ WorksheetError::InvalidRequest(_)) => {
                assert_eq!(err.to_string(), "invalid request: localidade value must not be blank");
            }
            other => panic!("expected invalid request, got {other:?}"),
        }
    }

    #[test]
    fn blank_reset_scope_value_is_rejected() {
        let mut store = RecordStore::open_in_memory().expect("open db");
        store
            .replace_with_preserve(&[cil_core::Record {
                cil: "A1".to_string(),
                nib: "N1".to_string(),
                estado: "prog".to_string(),
                ..cil_core::Record::default()
            }])
            .expect("load");
        let mut engine = WorksheetEngine::new(store, WorksheetConfig::default());

        assert!(matches!(
            engine.reset_claims(&ResetScope::Pt("  ".to_string())),
            Err(WorksheetError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.reset_claims(&ResetScope::Localidade(String::new())),
            Err(WorksheetError::InvalidRequest(_))
        ));
        assert_eq!(engine.store().claimed_count().expect("claimed"), 1);
        assert_eq!(engine.reset_claims(&ResetScope::All).expect("reset"), 1);
    }

    #[test]
    fn empty_store_reports_nothing_eligible() {
        let store = RecordStore::open_in_memory().expect("open db");
        let mut engine = WorksheetEngine::new(store, WorksheetConfig::default());
        let request = GenerationRequest::new(Grouping::Pt("ZONE1".to_string()), limits(10, 5));

        let outcome = engine.generate_batches(&request).expect("generate");
        assert_eq!(
            outcome,
            GenerationOutcome::NothingEligible {
                unmatched_identifiers: Vec::new(),
            }
        );
        assert!(outcome.batches().is_empty());
        assert_eq!(outcome.rows_claimed(), 0);
    }
}
