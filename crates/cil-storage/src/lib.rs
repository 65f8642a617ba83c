use cil_core::worksheet_contracts::{CriterionConstraint, FilterColumn, Grouping, ResetScope};
use cil_core::{normalize_lower, normalize_upper, Record, CLAIMED_STATE, RECORD_COLUMNS};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod dashboard;

pub const RECORD_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const UNCLAIMED_GUARD: &str = "COALESCE(cil_lower(estado), '') <> 'prog'";
const CLAIMED_GUARD: &str = "cil_lower(estado) = 'prog'";
const ELIGIBLE_ORDER: &str = "
    ORDER BY
        CASE WHEN seq IS NULL OR TRIM(seq) = '' THEN 1 ELSE 0 END, seq,
        CASE WHEN nib IS NULL OR TRIM(nib) = '' THEN 1 ELSE 0 END, nib,
        rowid
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Selection predicate shared by the eligibility query and the claim update.
/// Built only from static column names; caller values are always bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityFilter {
    pub grouping: Grouping,
    pub criterion: Option<CriterionConstraint>,
}

impl EligibilityFilter {
    pub fn new(grouping: Grouping, criterion: Option<CriterionConstraint>) -> Self {
        Self {
            grouping,
            criterion,
        }
    }

    fn predicate(&self) -> Result<(String, Vec<Value>), StorageError> {
        let mut clauses = vec![UNCLAIMED_GUARD.to_string()];
        let mut values = Vec::new();

        match &self.grouping {
            Grouping::Pt(value) => {
                clauses.push("cil_upper(pt) = ?".to_string());
                values.push(Value::Text(normalize_upper(value)));
            }
            Grouping::Localidade(value) => {
                clauses.push("cil_upper(localidade) = ?".to_string());
                values.push(Value::Text(normalize_upper(value)));
            }
            Grouping::ExplicitList(identifiers) => {
                clauses.push("cil IN (SELECT value FROM json_each(?))".to_string());
                values.push(Value::Text(json_list(identifiers)?));
            }
        }

        if let Some(criterion) = &self.criterion {
            clauses.push(format!("cil_upper({}) = ?", criterion.axis.column()));
            values.push(Value::Text(normalize_upper(&criterion.value)));
        }

        Ok((clauses.join(" AND "), values))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub rows_loaded: usize,
    /// Distinct identifiers whose claimed state was carried into the new
    /// snapshot.
    pub preserved_claims: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClaimOutcome {
    /// Rows that actually transitioned to claimed.
    pub rows_claimed: usize,
    /// Distinct sub-units with at least one transitioned row.
    pub nibs_claimed: BTreeSet<String>,
}

pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a file-backed store in WAL mode so request-scoped connections can
    /// read while another one writes.
    pub fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        register_normalizers(&conn)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > RECORD_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RECORD_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_records.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn record_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    pub fn claimed_count(&self) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM records WHERE {CLAIMED_GUARD}"),
            [],
            |row| row.get(0),
        )?)
    }

    /// Replaces the whole table with `records` in one transaction. Rows whose
    /// `cil` was claimed in the outgoing snapshot are forced back to claimed
    /// before the swap. On any error nothing is changed.
    pub fn replace_with_preserve(
        &mut self,
        records: &[Record],
    ) -> Result<ReplaceOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute_batch(
            "
            DROP TABLE IF EXISTS temp.records_staging;
            CREATE TEMP TABLE records_staging AS SELECT * FROM records WHERE 0;
            ",
        )?;

        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO records_staging ({}) VALUES ({})",
                RECORD_COLUMNS.join(", "),
                placeholders(RECORD_COLUMNS.len()),
            ))?;
            for record in records {
                insert.execute(params![
                    record.cil,
                    record.prod,
                    record.contador,
                    record.leitura,
                    record.mat_contador,
                    record.med_fat,
                    record.qtd,
                    record.valor,
                    record.situacao,
                    record.acordo,
                    record.nib,
                    record.seq,
                    record.localidade,
                    record.pt,
                    record.desv,
                    record.mat_leitura,
                    record.desc_uni,
                    record.est_contr,
                    record.anomalia,
                    record.id,
                    record.produto,
                    record.nome,
                    record.criterio,
                    record.desc_tp_cli,
                    record.tip,
                    record.sit_div,
                    record.modelo,
                    record.lat,
                    record.long,
                    record.est_inspec,
                    record.estado,
                ])?;
            }
        }

        let preserved = {
            let mut preserve = tx.prepare(&format!(
                "
                UPDATE records_staging
                SET estado = ?1
                WHERE TRIM(COALESCE(cil, '')) <> ''
                  AND cil IN (SELECT cil FROM records WHERE {CLAIMED_GUARD})
                RETURNING cil
                "
            ))?;
            let rows = preserve.query_map([CLAIMED_STATE], |row| row.get::<_, String>(0))?;
            let mut preserved = BTreeSet::new();
            for row in rows {
                preserved.insert(row?);
            }
            preserved
        };

        tx.execute("DELETE FROM records", [])?;
        let rows_loaded = tx.execute(
            &format!(
                "INSERT INTO records ({columns}) SELECT {columns} FROM records_staging",
                columns = RECORD_COLUMNS.join(", ")
            ),
            [],
        )?;
        tx.execute_batch("DROP TABLE temp.records_staging;")?;
        tx.commit()?;

        Ok(ReplaceOutcome {
            rows_loaded,
            preserved_claims: preserved.len(),
        })
    }

    /// Unclaimed records matching `filter`, ordered by `seq` then `nib` with
    /// blanks last.
    pub fn eligible_records(&self, filter: &EligibilityFilter) -> Result<Vec<Record>, StorageError> {
        let (predicate, values) = filter.predicate()?;
        let sql = format!(
            "SELECT {} FROM records WHERE {predicate} {ELIGIBLE_ORDER}",
            RECORD_COLUMNS.join(", ")
        );
        self.query_records(&sql, values)
    }

    /// Claims every still-unclaimed row of the given sub-units that also
    /// satisfies `filter`. The predicate is evaluated at commit time, so the
    /// counts reflect what this call actually transitioned.
    pub fn claim_batch(
        &mut self,
        nibs: &[String],
        filter: &EligibilityFilter,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut outcomes = self.claim_batches(&[nibs.to_vec()], filter)?;
        Ok(outcomes.pop().unwrap_or_default())
    }

    /// Claims several batches of sub-units in one transaction, returning one
    /// outcome per batch. Either every batch is claimed or none is.
    pub fn claim_batches(
        &mut self,
        batches: &[Vec<String>],
        filter: &EligibilityFilter,
    ) -> Result<Vec<ClaimOutcome>, StorageError> {
        let (predicate, values) = filter.predicate()?;
        let sql = format!(
            "
            UPDATE records
            SET estado = ?
            WHERE {predicate}
              AND TRIM(nib) IN (SELECT value FROM json_each(?))
            RETURNING TRIM(nib)
            "
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcomes = Vec::with_capacity(batches.len());
        {
            let mut statement = tx.prepare(&sql)?;
            for nibs in batches {
                let mut outcome = ClaimOutcome::default();
                if !nibs.is_empty() {
                    let mut bound = Vec::with_capacity(values.len() + 2);
                    bound.push(Value::Text(CLAIMED_STATE.to_string()));
                    bound.extend(values.iter().cloned());
                    bound.push(Value::Text(json_list(nibs)?));

                    let rows =
                        statement.query_map(params_from_iter(bound), |row| row.get::<_, String>(0))?;
                    for row in rows {
                        outcome.rows_claimed += 1;
                        outcome.nibs_claimed.insert(row?);
                    }
                }
                outcomes.push(outcome);
            }
        }
        tx.commit()?;

        Ok(outcomes)
    }

    /// Clears the claim on every claimed record in `scope`.
    pub fn reset_claims(&mut self, scope: &ResetScope) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let affected = match scope {
            ResetScope::Pt(value) => tx.execute(
                &format!("UPDATE records SET estado = '' WHERE {CLAIMED_GUARD} AND cil_upper(pt) = ?1"),
                [normalize_upper(value)],
            )?,
            ResetScope::Localidade(value) => tx.execute(
                &format!(
                    "UPDATE records SET estado = '' WHERE {CLAIMED_GUARD} AND cil_upper(localidade) = ?1"
                ),
                [normalize_upper(value)],
            )?,
            ResetScope::All => tx.execute(
                &format!("UPDATE records SET estado = '' WHERE {CLAIMED_GUARD}"),
                [],
            )?,
        };
        tx.commit()?;
        Ok(affected)
    }

    pub fn records_for_cil(&self, cil: &str) -> Result<Vec<Record>, StorageError> {
        let sql = format!(
            "SELECT {} FROM records WHERE cil = ? ORDER BY rowid",
            RECORD_COLUMNS.join(", ")
        );
        self.query_records(&sql, vec![Value::Text(cil.trim().to_string())])
    }

    pub fn all_records(&self) -> Result<Vec<Record>, StorageError> {
        let sql = format!(
            "SELECT {} FROM records ORDER BY rowid",
            RECORD_COLUMNS.join(", ")
        );
        self.query_records(&sql, Vec::new())
    }

    /// Distinct normalised values of `column`, for populating filter menus.
    pub fn distinct_values(&self, column: FilterColumn) -> Result<Vec<String>, StorageError> {
        let column = column.column();
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT DISTINCT cil_upper({column}) AS value
            FROM records
            WHERE {column} IS NOT NULL
              AND TRIM({column}) <> ''
              AND cil_upper({column}) NOT IN ('NONE', 'NULL')
            ORDER BY value
            "
        ))?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1)",
            [table_name],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(exists)
    }

    fn query_records(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Record>, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let rows = statement.query_map(params_from_iter(values), record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Registers the Unicode-aware normalisers used by every predicate, so SQL
/// comparisons fold case exactly like the loader does.
fn register_normalizers(conn: &Connection) -> Result<(), StorageError> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("cil_upper", 1, flags, |ctx| {
        Ok(text_arg(ctx.get_raw(0)).map(|value| normalize_upper(&value)))
    })?;
    conn.create_scalar_function("cil_lower", 1, flags, |ctx| {
        Ok(text_arg(ctx.get_raw(0)).map(|value| normalize_lower(&value)))
    })?;
    Ok(())
}

fn text_arg(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let text = |index: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(index)?.unwrap_or_default())
    };
    let number = |index: usize| -> rusqlite::Result<f64> {
        Ok(row.get::<_, Option<f64>>(index)?.unwrap_or(0.0))
    };

    Ok(Record {
        cil: text(0)?,
        prod: text(1)?,
        contador: text(2)?,
        leitura: text(3)?,
        mat_contador: text(4)?,
        med_fat: text(5)?,
        qtd: number(6)?,
        valor: number(7)?,
        situacao: text(8)?,
        acordo: text(9)?,
        nib: text(10)?,
        seq: text(11)?,
        localidade: text(12)?,
        pt: text(13)?,
        desv: text(14)?,
        mat_leitura: text(15)?,
        desc_uni: text(16)?,
        est_contr: text(17)?,
        anomalia: text(18)?,
        id: text(19)?,
        produto: text(20)?,
        nome: text(21)?,
        criterio: text(22)?,
        desc_tp_cli: text(23)?,
        tip: text(24)?,
        sit_div: text(25)?,
        modelo: text(26)?,
        lat: number(27)?,
        long: number(28)?,
        est_inspec: text(29)?,
        estado: text(30)?,
    })
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_list(values: &[String]) -> Result<String, StorageError> {
    serde_json::to_string(values).map_err(|err| StorageError::Serialization(err.to_string()))
}
