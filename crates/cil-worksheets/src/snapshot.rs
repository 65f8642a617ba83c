//! Decoding of uploaded snapshots: encoding fallback, delimiter sniffing and
//! positional row mapping. Nothing here touches the store.

use crate::WorksheetError;
use cil_core::Record;
use std::borrow::Cow;
use tracing::debug;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSnapshot {
    pub records: Vec<Record>,
    /// Width of the first row, which fixes the width of the snapshot.
    pub column_count: usize,
    /// Rows wider than the first one.
    pub skipped_rows: usize,
    pub delimiter: u8,
}

/// UTF-8 when valid, otherwise Latin-1.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|byte| char::from(*byte)).collect()),
    }
}

/// `;` wins only when it clearly dominates `,` in the sampled prefix.
pub fn sniff_delimiter(text: &str, sniff_bytes: usize) -> u8 {
    let sample = &text.as_bytes()[..text.len().min(sniff_bytes)];
    let commas = sample.iter().filter(|byte| **byte == b',').count();
    let semicolons = sample.iter().filter(|byte| **byte == b';').count();
    if semicolons > commas * 2 {
        b';'
    } else {
        b','
    }
}

pub fn parse_snapshot(
    bytes: &[u8],
    required_columns: usize,
    sniff_bytes: usize,
) -> Result<DecodedSnapshot, WorksheetError> {
    let text = decode_text(bytes);
    let delimiter = sniff_delimiter(&text, sniff_bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut column_count = None;
    let mut skipped_rows = 0;
    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|err| {
            WorksheetError::MalformedInput(format!("unreadable row {}: {err}", index + 1))
        })?;

        let width = *column_count.get_or_insert(row.len());
        if width < required_columns {
            return Err(WorksheetError::MalformedInput(format!(
                "snapshot must have at least {required_columns} columns, found {width}"
            )));
        }
        if row.len() > width {
            skipped_rows += 1;
            debug!(
                event = "snapshot_row_skipped",
                row = index + 1,
                width = row.len(),
                expected = width
            );
            continue;
        }

        let cells = row.iter().collect::<Vec<_>>();
        records.push(Record::from_snapshot_row(&cells));
    }

    let Some(column_count) = column_count else {
        return Err(WorksheetError::MalformedInput(
            "snapshot contains no rows".to_string(),
        ));
    };

    Ok(DecodedSnapshot {
        records,
        column_count,
        skipped_rows,
        delimiter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cil_core::SNAPSHOT_COLUMNS;

    fn line(delimiter: char, cells: &[(usize, &str)]) -> String {
        let mut row = vec![""; SNAPSHOT_COLUMNS];
        for (index, value) in cells {
            row[*index] = *value;
        }
        row.join(&delimiter.to_string())
    }

    #[test]
    fn semicolon_needs_to_dominate() {
        assert_eq!(sniff_delimiter("a;b;c;d\n", 1024), b';');
        assert_eq!(sniff_delimiter("a;b,c;d,e\n", 1024), b',');
        assert_eq!(sniff_delimiter("a;b;c;d;e,f\n", 1024), b';');
        assert_eq!(sniff_delimiter("", 1024), b',');
        assert_eq!(sniff_delimiter("a,b,c;;;;;;;;;;", 5), b',');
    }

    #[test]
    fn invalid_utf8_falls_back_to_latin1() {
        let bytes = b"\xC9VORA;\xE9";
        assert_eq!(decode_text(bytes), "ÉVORA;é");

        let with_bom = b"\xEF\xBB\xBFcil;nib";
        assert_eq!(decode_text(with_bom), "cil;nib");
    }

    #[test]
    fn rows_are_mapped_positionally() {
        let text = [
            line(';', &[(0, "A1"), (10, "N1"), (13, "zone1"), (30, "PROG")]),
            line(';', &[(0, "A2"), (7, "x"), (10, "N2"), (13, "zone1")]),
        ]
        .join("\n");

        let snapshot =
            parse_snapshot(text.as_bytes(), SNAPSHOT_COLUMNS, 1024).expect("parse snapshot");
        assert_eq!(snapshot.delimiter, b';');
        assert_eq!(snapshot.column_count, SNAPSHOT_COLUMNS);
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].pt, "ZONE1");
        assert_eq!(snapshot.records[0].estado, "prog");
        assert_eq!(snapshot.records[1].valor, 0.0);
    }

    #[test]
    fn narrow_snapshot_is_rejected() {
        let text = "A1;N1;ZONE1\n";
        match parse_snapshot(text.as_bytes(), SNAPSHOT_COLUMNS, 1024) {
            Err(WorksheetError::MalformedInput(reason)) => {
                assert!(reason.contains("at least 31 columns"), "{reason}");
            }
            other => panic!("expected malformed input, got {other:?}"),
        }
    }

    #[test]
    fn empty_snapshot_is_rejected() {
        assert!(matches!(
            parse_snapshot(b"\n\n", SNAPSHOT_COLUMNS, 1024),
            Err(WorksheetError::MalformedInput(_))
        ));
    }

    #[test]
    fn wider_rows_are_skipped_and_shorter_rows_padded() {
        let first = line(',', &[(0, "A1")]);
        let wider = format!("{},extra", line(',', &[(0, "A2")]));
        let shorter = "A3,p";
        let text = format!("{first}\n{wider}\n{shorter}\n");

        let snapshot =
            parse_snapshot(text.as_bytes(), SNAPSHOT_COLUMNS, 1024).expect("parse snapshot");
        assert_eq!(snapshot.skipped_rows, 1);
        assert_eq!(
            snapshot
                .records
                .iter()
                .map(|record| record.cil.as_str())
                .collect::<Vec<_>>(),
            vec!["A1", "A3"]
        );
        assert_eq!(snapshot.records[1].prod, "p");
    }
}
