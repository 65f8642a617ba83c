use crate::{normalize_upper, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_GROUPS_PER_BATCH: usize = 50;
pub const DEFAULT_MAX_BATCHES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("unknown grouping mode: {0}")]
    UnknownGroupingMode(String),
    #[error("unrecognized criterion axis: {0}")]
    UnknownCriterionAxis(String),
    #[error("unknown reset scope: {0}")]
    UnknownResetScope(String),
    #[error("unknown filter column: {0}")]
    UnknownFilterColumn(String),
    #[error("{field} must not be blank")]
    BlankValue { field: &'static str },
    #[error("{field} must be > 0")]
    ZeroLimit { field: &'static str },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    ByPt,
    ByLocalidade,
    ByExplicitList,
}

impl GroupingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingMode::ByPt => "PT",
            GroupingMode::ByLocalidade => "LOCALIDADE",
            GroupingMode::ByExplicitList => "AVULSO",
        }
    }
}

impl fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingMode {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pt" | "by_pt" | "by-pt" => Ok(GroupingMode::ByPt),
            "localidade" | "by_localidade" | "by-localidade" => Ok(GroupingMode::ByLocalidade),
            "avulso" | "list" | "explicit-list" | "by_explicit_list" => {
                Ok(GroupingMode::ByExplicitList)
            }
            _ => Err(ContractError::UnknownGroupingMode(input.trim().to_string())),
        }
    }
}

/// The active grouping of one generation call together with its value(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum Grouping {
    Pt(String),
    Localidade(String),
    ExplicitList(Vec<String>),
}

impl Grouping {
    pub fn mode(&self) -> GroupingMode {
        match self {
            Grouping::Pt(_) => GroupingMode::ByPt,
            Grouping::Localidade(_) => GroupingMode::ByLocalidade,
            Grouping::ExplicitList(_) => GroupingMode::ByExplicitList,
        }
    }

    /// Normalises the grouping value(s): axis values are uppercased and
    /// trimmed; identifiers are trimmed, blanks dropped and duplicates removed
    /// keeping first occurrence.
    pub fn normalized(&self) -> Result<Self, ContractError> {
        match self {
            Grouping::Pt(value) => {
                non_blank(value, "pt value").map(|value| Grouping::Pt(normalize_upper(value)))
            }
            Grouping::Localidade(value) => non_blank(value, "localidade value")
                .map(|value| Grouping::Localidade(normalize_upper(value))),
            Grouping::ExplicitList(identifiers) => {
                let mut seen = BTreeSet::new();
                let cleaned = identifiers
                    .iter()
                    .map(|identifier| identifier.trim())
                    .filter(|identifier| !identifier.is_empty())
                    .filter(|identifier| seen.insert(identifier.to_string()))
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if cleaned.is_empty() {
                    return Err(ContractError::BlankValue {
                        field: "identifier list",
                    });
                }
                Ok(Grouping::ExplicitList(cleaned))
            }
        }
    }
}

/// Closed set of secondary classification axes. Each resolves to a static
/// column of the `records` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CriterionAxis {
    Criterio,
    Anomalia,
    DescTpCli,
    EstContr,
    SitDiv,
    Desv,
    EstInspec,
}

impl CriterionAxis {
    pub const ALL: [CriterionAxis; 7] = [
        CriterionAxis::Criterio,
        CriterionAxis::Anomalia,
        CriterionAxis::DescTpCli,
        CriterionAxis::EstContr,
        CriterionAxis::SitDiv,
        CriterionAxis::Desv,
        CriterionAxis::EstInspec,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            CriterionAxis::Criterio => "criterio",
            CriterionAxis::Anomalia => "anomalia",
            CriterionAxis::DescTpCli => "desc_tp_cli",
            CriterionAxis::EstContr => "est_contr",
            CriterionAxis::SitDiv => "sit_div",
            CriterionAxis::Desv => "desv",
            CriterionAxis::EstInspec => "est_inspec",
        }
    }

    /// Operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            CriterionAxis::Criterio => "Criterio",
            CriterionAxis::Anomalia => "Anomalia",
            CriterionAxis::DescTpCli => "DESC_TP_CLI",
            CriterionAxis::EstContr => "EST_CTR",
            CriterionAxis::SitDiv => "sit_div",
            CriterionAxis::Desv => "desv",
            CriterionAxis::EstInspec => "est_inspec",
        }
    }

    pub fn value_of<'a>(&self, record: &'a Record) -> &'a str {
        match self {
            CriterionAxis::Criterio => &record.criterio,
            CriterionAxis::Anomalia => &record.anomalia,
            CriterionAxis::DescTpCli => &record.desc_tp_cli,
            CriterionAxis::EstContr => &record.est_contr,
            CriterionAxis::SitDiv => &record.sit_div,
            CriterionAxis::Desv => &record.desv,
            CriterionAxis::EstInspec => &record.est_inspec,
        }
    }
}

impl fmt::Display for CriterionAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CriterionAxis {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "criterio" => Ok(CriterionAxis::Criterio),
            "anomalia" => Ok(CriterionAxis::Anomalia),
            "desc_tp_cli" => Ok(CriterionAxis::DescTpCli),
            "est_ctr" | "est_contr" => Ok(CriterionAxis::EstContr),
            "sit_div" => Ok(CriterionAxis::SitDiv),
            "desv" => Ok(CriterionAxis::Desv),
            "est_inspec" => Ok(CriterionAxis::EstInspec),
            _ => Err(ContractError::UnknownCriterionAxis(input.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionConstraint {
    pub axis: CriterionAxis,
    /// Always stored uppercased and trimmed.
    pub value: String,
}

impl CriterionConstraint {
    pub fn new(axis: CriterionAxis, value: &str) -> Result<Self, ContractError> {
        let value = non_blank(value, "criterion value")?;
        Ok(Self {
            axis,
            value: normalize_upper(value),
        })
    }

    /// Resolves an axis name supplied by a caller. Unknown axes are rejected
    /// here, before any query is built.
    pub fn parse(axis: &str, value: &str) -> Result<Self, ContractError> {
        let axis = axis.parse::<CriterionAxis>()?;
        Self::new(axis, value)
    }

    pub fn matches(&self, record: &Record) -> bool {
        normalize_upper(self.axis.value_of(record)) == self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum ResetScope {
    Pt(String),
    Localidade(String),
    /// Every claimed record system-wide ("avulso").
    All,
}

impl ResetScope {
    /// Builds a scope from its operator name and optional value.
    pub fn parse(scope: &str, value: Option<&str>) -> Result<Self, ContractError> {
        let normalized = scope.trim().to_lowercase();
        match normalized.as_str() {
            "pt" => {
                let value = non_blank(value.unwrap_or_default(), "pt value")?;
                Ok(ResetScope::Pt(normalize_upper(value)))
            }
            "localidade" => {
                let value = non_blank(value.unwrap_or_default(), "localidade value")?;
                Ok(ResetScope::Localidade(normalize_upper(value)))
            }
            "avulso" | "all" => Ok(ResetScope::All),
            _ => Err(ContractError::UnknownResetScope(scope.trim().to_string())),
        }
    }

    /// Uppercases the scope value. A blank value is rejected.
    pub fn normalized(&self) -> Result<Self, ContractError> {
        match self {
            ResetScope::Pt(value) => {
                non_blank(value, "pt value").map(|value| ResetScope::Pt(normalize_upper(value)))
            }
            ResetScope::Localidade(value) => non_blank(value, "localidade value")
                .map(|value| ResetScope::Localidade(normalize_upper(value))),
            ResetScope::All => Ok(ResetScope::All),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResetScope::Pt(_) => "PT",
            ResetScope::Localidade(_) => "LOCALIDADE",
            ResetScope::All => "AVULSO",
        }
    }
}

/// Columns that support distinct-value enumeration and dashboard grouping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterColumn {
    Pt,
    Localidade,
    Criterion(CriterionAxis),
}

impl FilterColumn {
    pub fn column(&self) -> &'static str {
        match self {
            FilterColumn::Pt => "pt",
            FilterColumn::Localidade => "localidade",
            FilterColumn::Criterion(axis) => axis.column(),
        }
    }
}

impl FromStr for FilterColumn {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pt" => Ok(FilterColumn::Pt),
            "localidade" => Ok(FilterColumn::Localidade),
            _ => input
                .parse::<CriterionAxis>()
                .map(FilterColumn::Criterion)
                .map_err(|_| ContractError::UnknownFilterColumn(input.trim().to_string())),
        }
    }
}

/// Bounds for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_batches: usize,
    pub groups_per_batch: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batches: DEFAULT_MAX_BATCHES,
            groups_per_batch: DEFAULT_GROUPS_PER_BATCH,
        }
    }
}

impl BatchLimits {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.max_batches == 0 {
            return Err(ContractError::ZeroLimit {
                field: "max batches",
            });
        }
        if self.groups_per_batch == 0 {
            return Err(ContractError::ZeroLimit {
                field: "groups per batch",
            });
        }
        Ok(())
    }
}

/// One numbered work sheet. Records keep the eligibility order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub number: usize,
    pub nibs: Vec<String>,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn group_count(&self) -> usize {
        self.nibs.len()
    }
}

/// Distinct non-blank sub-unit keys in first-seen order.
pub fn distinct_nibs(records: &[Record]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    records
        .iter()
        .map(Record::nib_key)
        .filter(|nib| !nib.is_empty())
        .filter(|nib| seen.insert(nib.to_string()))
        .map(str::to_string)
        .collect()
}

/// Number of batches a partition of `group_count` sub-units yields.
pub fn batch_count(group_count: usize, limits: &BatchLimits) -> usize {
    if limits.groups_per_batch == 0 {
        return 0;
    }
    group_count
        .div_ceil(limits.groups_per_batch)
        .min(limits.max_batches)
}

/// Slices an ordered eligible set into work sheets. Batch `k` holds every
/// record whose nib falls in the k-th contiguous slice of `groups_per_batch`
/// distinct nibs. Records without a nib, or whose nib falls past the last
/// emitted slice, are left out.
pub fn partition_batches(records: Vec<Record>, limits: &BatchLimits) -> Vec<Batch> {
    let nibs = distinct_nibs(&records);
    let count = batch_count(nibs.len(), limits);
    if count == 0 {
        return Vec::new();
    }

    let mut batch_of_nib = BTreeMap::new();
    let mut batches = nibs
        .chunks(limits.groups_per_batch)
        .take(count)
        .enumerate()
        .map(|(index, slice)| {
            for nib in slice {
                batch_of_nib.insert(nib.clone(), index);
            }
            Batch {
                number: index + 1,
                nibs: slice.to_vec(),
                records: Vec::new(),
            }
        })
        .collect::<Vec<_>>();

    for record in records {
        if let Some(index) = batch_of_nib.get(record.nib_key()).copied() {
            batches[index].records.push(record);
        }
    }

    batches
}

fn non_blank<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ContractError> {
    if value.trim().is_empty() {
        Err(ContractError::BlankValue { field })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cil: &str, nib: &str) -> Record {
        Record {
            cil: cil.to_string(),
            nib: nib.to_string(),
            ..Record::default()
        }
    }

    fn limits(max_batches: usize, groups_per_batch: usize) -> BatchLimits {
        BatchLimits {
            max_batches,
            groups_per_batch,
        }
    }

    #[test]
    fn twenty_five_records_over_five_nibs_make_three_sheets() {
        let records = (0..25)
            .map(|index| record(&format!("C{index}"), &format!("N{}", index % 5)))
            .collect::<Vec<_>>();

        let batches = partition_batches(records, &limits(10, 2));

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(Batch::group_count).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(batches[0].nibs, vec!["N0", "N1"]);
        assert_eq!(batches[2].nibs, vec!["N4"]);
        assert_eq!(
            batches.iter().map(|batch| batch.records.len()).sum::<usize>(),
            25
        );
        assert_eq!(
            batches.iter().map(|batch| batch.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn batch_count_is_capped_by_max_batches() {
        let cases: [(usize, usize, usize); 6] =
            [(0, 3, 5), (1, 3, 5), (9, 3, 5), (10, 3, 5), (100, 3, 5), (7, 7, 1)];
        for (groups, g, m) in cases {
            let records = (0..groups)
                .map(|index| record(&format!("C{index}"), &format!("N{index:03}")))
                .collect::<Vec<_>>();
            let batches = partition_batches(records, &limits(m, g));
            assert_eq!(batches.len(), groups.div_ceil(g).min(m), "G={groups} g={g} m={m}");

            let mut seen = BTreeSet::new();
            for (index, batch) in batches.iter().enumerate() {
                assert_eq!(batch.group_count(), g.min(groups - g * index));
                for nib in &batch.nibs {
                    assert!(seen.insert(nib.clone()), "nib {nib} in two batches");
                }
            }
        }
    }

    #[test]
    fn blank_nibs_never_form_groups() {
        let records = vec![record("A", ""), record("B", "  "), record("C", "N1")];
        let batches = partition_batches(records, &limits(10, 5));

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].nibs, vec!["N1"]);
        assert_eq!(batches[0].records.len(), 1);

        let none = partition_batches(vec![record("A", "")], &limits(10, 5));
        assert!(none.is_empty());
    }

    #[test]
    fn nib_order_follows_first_appearance() {
        let records = vec![
            record("1", "N9"),
            record("2", "N1"),
            record("3", "N9"),
            record("4", "N5"),
        ];
        assert_eq!(distinct_nibs(&records), vec!["N9", "N1", "N5"]);

        let batches = partition_batches(records, &limits(10, 1));
        assert_eq!(batches[0].records.len(), 2);
        assert_eq!(batches[0].records[1].cil, "3");
    }

    #[test]
    fn criterion_axes_resolve_from_operator_labels() {
        assert_eq!(
            "EST_CTR".parse::<CriterionAxis>().expect("axis"),
            CriterionAxis::EstContr
        );
        assert_eq!(
            "Anomalia".parse::<CriterionAxis>().expect("axis"),
            CriterionAxis::Anomalia
        );
        for axis in CriterionAxis::ALL {
            assert_eq!(axis.label().parse::<CriterionAxis>().expect("axis"), axis);
        }
        assert_eq!(
            "estado; DROP TABLE records".parse::<CriterionAxis>(),
            Err(ContractError::UnknownCriterionAxis(
                "estado; DROP TABLE records".to_string()
            ))
        );
    }

    #[test]
    fn criterion_constraint_matches_normalised_values() {
        let constraint = CriterionConstraint::parse("criterio", " fraude ").expect("constraint");
        assert_eq!(constraint.value, "FRAUDE");

        let mut candidate = record("A", "N1");
        candidate.criterio = "Fraude ".to_string();
        assert!(constraint.matches(&candidate));

        candidate.criterio = "OUTRO".to_string();
        assert!(!constraint.matches(&candidate));

        assert!(CriterionConstraint::parse("criterio", "  ").is_err());
    }

    #[test]
    fn explicit_list_is_trimmed_and_deduplicated() {
        let grouping = Grouping::ExplicitList(vec![
            " A1".to_string(),
            "A2".to_string(),
            "A1 ".to_string(),
            "".to_string(),
        ]);
        assert_eq!(
            grouping.normalized().expect("normalized"),
            Grouping::ExplicitList(vec!["A1".to_string(), "A2".to_string()])
        );
        assert!(Grouping::ExplicitList(vec![" ".to_string()])
            .normalized()
            .is_err());
        assert_eq!(
            Grouping::Pt(" zone1 ".to_string())
                .normalized()
                .expect("normalized"),
            Grouping::Pt("ZONE1".to_string())
        );
        assert!(Grouping::Localidade(String::new()).normalized().is_err());
    }

    #[test]
    fn reset_scope_requires_value_for_axis_scopes() {
        assert_eq!(
            ResetScope::parse("pt", Some(" zone1")).expect("scope"),
            ResetScope::Pt("ZONE1".to_string())
        );
        assert_eq!(
            ResetScope::parse("AVULSO", None).expect("scope"),
            ResetScope::All
        );
        assert!(ResetScope::parse("localidade", None).is_err());
        assert!(ResetScope::parse("nib", Some("x")).is_err());
    }

    #[test]
    fn constructed_reset_scopes_are_normalized() {
        assert_eq!(
            ResetScope::Localidade(" évora ".to_string())
                .normalized()
                .expect("scope"),
            ResetScope::Localidade("ÉVORA".to_string())
        );
        assert_eq!(
            ResetScope::Pt("\t".to_string()).normalized(),
            Err(ContractError::BlankValue { field: "pt value" })
        );
        assert_eq!(ResetScope::All.normalized(), Ok(ResetScope::All));
    }

    #[test]
    fn limits_reject_zero() {
        assert!(limits(0, 1).validate().is_err());
        assert!(limits(1, 0).validate().is_err());
        assert!(BatchLimits::default().validate().is_ok());
        assert_eq!(batch_count(5, &limits(10, 0)), 0);
    }

    #[test]
    fn filter_columns_cover_axes_and_groupings() {
        assert_eq!("PT".parse::<FilterColumn>().expect("column").column(), "pt");
        assert_eq!(
            "desv".parse::<FilterColumn>().expect("column"),
            FilterColumn::Criterion(CriterionAxis::Desv)
        );
        assert!("nome".parse::<FilterColumn>().is_err());
    }
}
