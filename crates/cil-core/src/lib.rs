use serde::{Deserialize, Serialize};

pub mod worksheet_contracts;

/// Processing-state sentinel for a record assigned to a work sheet.
pub const CLAIMED_STATE: &str = "prog";
pub const UNCLAIMED_STATE: &str = "";
pub const SNAPSHOT_COLUMNS: usize = 31;

/// Positional layout of a snapshot row, which is also the column order of the
/// `records` table.
pub const RECORD_COLUMNS: [&str; SNAPSHOT_COLUMNS] = [
    "cil",
    "prod",
    "contador",
    "leitura",
    "mat_contador",
    "med_fat",
    "qtd",
    "valor",
    "situacao",
    "acordo",
    "nib",
    "seq",
    "localidade",
    "pt",
    "desv",
    "mat_leitura",
    "desc_uni",
    "est_contr",
    "anomalia",
    "id",
    "produto",
    "nome",
    "criterio",
    "desc_tp_cli",
    "tip",
    "sit_div",
    "modelo",
    "lat",
    "long",
    "est_inspec",
    "estado",
];

pub fn normalize_upper(value: &str) -> String {
    value.trim().to_uppercase()
}

pub fn normalize_lower(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn is_claimed_state(estado: &str) -> bool {
    normalize_lower(estado) == CLAIMED_STATE
}

/// Coerces a snapshot cell to a number. Anything unparseable or non-finite
/// becomes zero.
pub fn coerce_number(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub cil: String,
    pub prod: String,
    pub contador: String,
    pub leitura: String,
    pub mat_contador: String,
    pub med_fat: String,
    pub qtd: f64,
    pub valor: f64,
    pub situacao: String,
    pub acordo: String,
    pub nib: String,
    pub seq: String,
    pub localidade: String,
    pub pt: String,
    pub desv: String,
    pub mat_leitura: String,
    pub desc_uni: String,
    pub est_contr: String,
    pub anomalia: String,
    pub id: String,
    pub produto: String,
    pub nome: String,
    pub criterio: String,
    pub desc_tp_cli: String,
    pub tip: String,
    pub sit_div: String,
    pub modelo: String,
    pub lat: f64,
    pub long: f64,
    pub est_inspec: String,
    pub estado: String,
}

impl Record {
    /// Builds a record from one positional snapshot row, applying the load
    /// normalisation: every text cell trimmed, `pt`/`localidade`/`criterio`
    /// uppercased, `estado` lowercased, numerics coerced. Missing trailing
    /// cells are treated as blank and cells past the schema are ignored.
    pub fn from_snapshot_row<S: AsRef<str>>(cells: &[S]) -> Self {
        let text = |index: usize| -> String {
            cells
                .get(index)
                .map(|cell| cell.as_ref().trim().to_string())
                .unwrap_or_default()
        };
        let number = |index: usize| -> f64 {
            cells
                .get(index)
                .map(|cell| coerce_number(cell.as_ref()))
                .unwrap_or(0.0)
        };

        Self {
            cil: text(0),
            prod: text(1),
            contador: text(2),
            leitura: text(3),
            mat_contador: text(4),
            med_fat: text(5),
            qtd: number(6),
            valor: number(7),
            situacao: text(8),
            acordo: text(9),
            nib: text(10),
            seq: text(11),
            localidade: normalize_upper(&text(12)),
            pt: normalize_upper(&text(13)),
            desv: text(14),
            mat_leitura: text(15),
            desc_uni: text(16),
            est_contr: text(17),
            anomalia: text(18),
            id: text(19),
            produto: text(20),
            nome: text(21),
            criterio: normalize_upper(&text(22)),
            desc_tp_cli: text(23),
            tip: text(24),
            sit_div: text(25),
            modelo: text(26),
            lat: number(27),
            long: number(28),
            est_inspec: text(29),
            estado: normalize_lower(&text(30)),
        }
    }

    /// Cells in `RECORD_COLUMNS` order, used when framing batches for output.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.cil.clone(),
            self.prod.clone(),
            self.contador.clone(),
            self.leitura.clone(),
            self.mat_contador.clone(),
            self.med_fat.clone(),
            self.qtd.to_string(),
            self.valor.to_string(),
            self.situacao.clone(),
            self.acordo.clone(),
            self.nib.clone(),
            self.seq.clone(),
            self.localidade.clone(),
            self.pt.clone(),
            self.desv.clone(),
            self.mat_leitura.clone(),
            self.desc_uni.clone(),
            self.est_contr.clone(),
            self.anomalia.clone(),
            self.id.clone(),
            self.produto.clone(),
            self.nome.clone(),
            self.criterio.clone(),
            self.desc_tp_cli.clone(),
            self.tip.clone(),
            self.sit_div.clone(),
            self.modelo.clone(),
            self.lat.to_string(),
            self.long.to_string(),
            self.est_inspec.clone(),
            self.estado.clone(),
        ]
    }

    pub fn is_claimed(&self) -> bool {
        is_claimed_state(&self.estado)
    }

    /// Sub-unit key as used by the partitioner; blank means "no usable nib".
    pub fn nib_key(&self) -> &str {
        self.nib.trim()
    }
}
