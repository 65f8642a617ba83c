//! Read-only aggregates behind the operational dashboards. None of these
//! queries take part in claiming; they may observe a slightly stale snapshot.

use crate::{RecordStore, StorageError};
use cil_core::worksheet_contracts::CriterionAxis;
use cil_core::{normalize_lower, normalize_upper};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

const TOP_LIMIT: i64 = 15;
const MIN_RECORDS_PER_PT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GeneralStats {
    pub total_records: i64,
    pub distinct_cils: i64,
    pub distinct_pts: i64,
    pub distinct_localidades: i64,
    pub distinct_nibs: i64,
    pub in_progress: i64,
    pub total_qtd: f64,
    pub total_valor: f64,
    pub avg_qtd: f64,
    pub avg_valor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PtEfficiency {
    pub pt: String,
    pub total_records: i64,
    pub in_progress: i64,
    pub progress_pct: f64,
    pub total_valor: f64,
    pub avg_valor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalidadeValue {
    pub localidade: String,
    pub total_records: i64,
    pub total_valor: f64,
    pub avg_valor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoDensity {
    pub lat: f64,
    pub long: f64,
    pub density: i64,
    pub total_valor: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct OperationalMetrics {
    pub pt_efficiency: Vec<PtEfficiency>,
    pub top_localidades: Vec<LocalidadeValue>,
    pub geolocation: Vec<GeoDensity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionBucket {
    pub value: String,
    pub count: i64,
    pub total_valor: f64,
    pub avg_valor: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportFilter {
    pub criterio: Option<String>,
    pub pt: Option<String>,
    pub localidade: Option<String>,
    pub estado: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub cil: String,
    pub pt: String,
    pub localidade: String,
    pub criterio: String,
    pub anomalia: String,
    pub situacao: String,
    pub qtd: f64,
    pub valor: f64,
    pub estado: String,
    pub nib: String,
    pub desc_tp_cli: String,
    pub est_contr: String,
    pub sit_div: String,
    pub est_inspec: String,
}

impl RecordStore {
    pub fn general_stats(&self) -> Result<GeneralStats, StorageError> {
        let stats = self.conn.query_row(
            "
            SELECT
                COUNT(*),
                COUNT(DISTINCT cil),
                COUNT(DISTINCT pt),
                COUNT(DISTINCT localidade),
                COUNT(DISTINCT nib),
                COALESCE(SUM(CASE WHEN cil_lower(estado) = 'prog' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(qtd), 0),
                COALESCE(SUM(valor), 0),
                COALESCE(AVG(qtd), 0),
                COALESCE(AVG(valor), 0)
            FROM records
            ",
            [],
            |row| {
                Ok(GeneralStats {
                    total_records: row.get(0)?,
                    distinct_cils: row.get(1)?,
                    distinct_pts: row.get(2)?,
                    distinct_localidades: row.get(3)?,
                    distinct_nibs: row.get(4)?,
                    in_progress: row.get(5)?,
                    total_qtd: row.get(6)?,
                    total_valor: row.get(7)?,
                    avg_qtd: row.get(8)?,
                    avg_valor: row.get(9)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub fn operational_metrics(&self) -> Result<OperationalMetrics, StorageError> {
        let mut pt_statement = self.conn.prepare(
            "
            SELECT
                cil_upper(pt) AS pt_key,
                COUNT(*) AS total_records,
                SUM(CASE WHEN cil_lower(estado) = 'prog' THEN 1 ELSE 0 END),
                ROUND(SUM(CASE WHEN cil_lower(estado) = 'prog' THEN 1 ELSE 0 END) * 100.0 / COUNT(*), 2),
                COALESCE(SUM(valor), 0),
                COALESCE(AVG(valor), 0)
            FROM records
            WHERE pt IS NOT NULL AND TRIM(pt) <> ''
            GROUP BY pt_key
            HAVING COUNT(*) > ?1
            ORDER BY total_records DESC, pt_key
            LIMIT ?2
            ",
        )?;
        let rows = pt_statement.query_map([MIN_RECORDS_PER_PT, TOP_LIMIT], |row| {
            Ok(PtEfficiency {
                pt: row.get(0)?,
                total_records: row.get(1)?,
                in_progress: row.get(2)?,
                progress_pct: row.get(3)?,
                total_valor: row.get(4)?,
                avg_valor: row.get(5)?,
            })
        })?;
        let mut pt_efficiency = Vec::new();
        for row in rows {
            pt_efficiency.push(row?);
        }

        let mut localidade_statement = self.conn.prepare(
            "
            SELECT
                cil_upper(localidade) AS localidade_key,
                COUNT(*),
                COALESCE(SUM(valor), 0) AS total_valor,
                COALESCE(AVG(valor), 0)
            FROM records
            WHERE localidade IS NOT NULL AND TRIM(localidade) <> ''
            GROUP BY localidade_key
            ORDER BY total_valor DESC, localidade_key
            LIMIT ?1
            ",
        )?;
        let rows = localidade_statement.query_map([TOP_LIMIT], |row| {
            Ok(LocalidadeValue {
                localidade: row.get(0)?,
                total_records: row.get(1)?,
                total_valor: row.get(2)?,
                avg_valor: row.get(3)?,
            })
        })?;
        let mut top_localidades = Vec::new();
        for row in rows {
            top_localidades.push(row?);
        }

        let mut geo_statement = self.conn.prepare(
            "
            SELECT lat, long, COUNT(*), COALESCE(SUM(valor), 0)
            FROM records
            WHERE lat IS NOT NULL AND long IS NOT NULL
              AND lat <> 0 AND long <> 0
            GROUP BY lat, long
            HAVING COUNT(*) > 1
            ORDER BY lat, long
            ",
        )?;
        let rows = geo_statement.query_map([], |row| {
            Ok(GeoDensity {
                lat: row.get(0)?,
                long: row.get(1)?,
                density: row.get(2)?,
                total_valor: row.get(3)?,
            })
        })?;
        let mut geolocation = Vec::new();
        for row in rows {
            geolocation.push(row?);
        }

        Ok(OperationalMetrics {
            pt_efficiency,
            top_localidades,
            geolocation,
        })
    }

    /// Count and valor per value of `axis`, optionally restricted to one value.
    pub fn criterion_distribution(
        &self,
        axis: CriterionAxis,
        only_value: Option<&str>,
    ) -> Result<Vec<CriterionBucket>, StorageError> {
        let column = axis.column();
        let mut sql = format!(
            "
            SELECT
                cil_upper({column}) AS bucket,
                COUNT(*) AS quantity,
                COALESCE(SUM(valor), 0) AS total_valor,
                COALESCE(AVG(valor), 0)
            FROM records
            WHERE {column} IS NOT NULL AND TRIM({column}) <> ''
            "
        );
        let mut values = Vec::new();
        if let Some(value) = only_value.filter(|value| !value.trim().is_empty()) {
            sql.push_str(&format!(" AND cil_upper({column}) = ?"));
            values.push(Value::Text(normalize_upper(value)));
        }
        sql.push_str(" GROUP BY bucket ORDER BY quantity DESC, total_valor DESC, bucket");

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values), |row| {
            Ok(CriterionBucket {
                value: row.get(0)?,
                count: row.get(1)?,
                total_valor: row.get(2)?,
                avg_valor: row.get(3)?,
            })
        })?;

        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }

    pub fn detailed_report(&self, filter: &ReportFilter) -> Result<Vec<ReportRow>, StorageError> {
        let mut sql = String::from(
            "
            SELECT cil, pt, localidade, criterio, anomalia, situacao, qtd, valor,
                   estado, nib, desc_tp_cli, est_contr, sit_div, est_inspec
            FROM records
            WHERE 1 = 1
            ",
        );
        let mut values = Vec::new();
        let upper_filters = [
            ("criterio", filter.criterio.as_deref()),
            ("pt", filter.pt.as_deref()),
            ("localidade", filter.localidade.as_deref()),
        ];
        for (column, value) in upper_filters {
            if let Some(value) = value.filter(|value| !value.trim().is_empty()) {
                sql.push_str(&format!(" AND cil_upper({column}) = ?"));
                values.push(Value::Text(normalize_upper(value)));
            }
        }
        if let Some(estado) = filter
            .estado
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            sql.push_str(" AND cil_lower(estado) = ?");
            values.push(Value::Text(normalize_lower(estado)));
        }
        sql.push_str(" ORDER BY pt, localidade, criterio, rowid");

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values), |row| {
            let text = |index: usize| -> rusqlite::Result<String> {
                Ok(row.get::<_, Option<String>>(index)?.unwrap_or_default())
            };
            Ok(ReportRow {
                cil: text(0)?,
                pt: text(1)?,
                localidade: text(2)?,
                criterio: text(3)?,
                anomalia: text(4)?,
                situacao: text(5)?,
                qtd: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                valor: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                estado: text(8)?,
                nib: text(9)?,
                desc_tp_cli: text(10)?,
                est_contr: text(11)?,
                sit_div: text(12)?,
                est_inspec: text(13)?,
            })
        })?;

        let mut report = Vec::new();
        for row in rows {
            report.push(row?);
        }
        Ok(report)
    }
}
