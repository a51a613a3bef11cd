use thiserror::Error;

use crate::normalize::normalize_cep;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("could not read the uploaded spreadsheet: {0}")]
    Malformed(#[from] csv::Error),
    #[error("the uploaded spreadsheet is empty")]
    Empty,
}

/// Extract the ordered raw CEP candidates from an uploaded CSV.
///
/// The first row is treated as a header when it names a case-insensitive
/// `cep` column and carries no cell that is itself a valid code; that
/// column then feeds the batch and the header row itself does not. A first
/// row holding a resolvable code is data even if some other cell spells
/// `cep`. Without a header every row's first column is taken as a
/// candidate. Values are passed through as-is: normalization and rejection
/// of junk cells happen later in the batch processor.
pub fn candidate_rows(bytes: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut records = reader.records();

    let first = match records.next() {
        Some(record) => record?,
        None => return Err(IngestError::Empty),
    };

    let cep_column = first
        .iter()
        .position(|field| field.trim().eq_ignore_ascii_case("cep"))
        .filter(|_| !first.iter().any(|field| normalize_cep(field).is_some()));

    let mut rows = Vec::new();

    // No header row: the first record is already data from column zero.
    let column = match cep_column {
        Some(index) => index,
        None => {
            if let Some(value) = first.get(0) {
                rows.push(value.trim().to_owned());
            }
            0
        }
    };

    for record in records {
        let record = record?;
        if let Some(value) = record.get(column) {
            rows.push(value.trim().to_owned());
        }
    }

    Ok(rows)
}
