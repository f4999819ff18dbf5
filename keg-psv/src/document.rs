//! PSV documents and rows

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::schema::Schema;

/// A parsed PSV document: a schema, an optional sequence number and rows.
#[derive(Debug, Clone)]
pub struct PsvDocument {
    schema: Arc<Schema>,
    sequence_number: Option<u32>,
    rows: Vec<PsvRow>,
}

/// A single row, sharing its document's schema.
#[derive(Debug, Clone)]
pub struct PsvRow {
    schema: Arc<Schema>,
    cells: Vec<String>,
}

impl PsvDocument {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            sequence_number: None,
            rows: Vec::new(),
        }
    }

    /// Parse a complete PSV document.
    ///
    /// Blank lines and `#`-prefixed comment lines are ignored, except for
    /// `## seqn = N` lines, which carry the server's sequence number.
    /// Cell values are validated against the column types.
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines();

        let header = loop {
            match lines.next() {
                None => return Err(Error::EmptyDocument),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };

        let mut document = PsvDocument::new(Schema::parse_header(header)?);

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                // `## seqn = 12345` is data smuggled inside a comment.
                if let Some(seqn) = rest.trim_start_matches('#').trim().strip_prefix("seqn") {
                    if let Ok(n) = seqn.trim_start_matches(['=', ' ']).trim().parse() {
                        document.sequence_number = Some(n);
                    }
                }
                continue;
            }

            document.push_row(line.split('|').map(str::to_string).collect())?;
        }

        trace!(
            rows = document.rows.len(),
            seqn = ?document.sequence_number,
            "parsed PSV document"
        );
        Ok(document)
    }

    /// Append a row, validating cell count and cell types.
    pub fn push_row(&mut self, cells: Vec<String>) -> Result<()> {
        if cells.len() != self.schema.field_count() {
            return Err(Error::CellCountMismatch {
                row: self.rows.len(),
                expected: self.schema.field_count(),
                actual: cells.len(),
            });
        }

        for (field, cell) in self.schema.fields().iter().zip(&cells) {
            if !field.field_type.accepts(cell) {
                return Err(Error::InvalidCell {
                    row: self.rows.len(),
                    column: field.name.clone(),
                    type_name: field.field_type.type_name(),
                    value: cell.clone(),
                });
            }
        }

        self.rows.push(PsvRow {
            schema: Arc::clone(&self.schema),
            cells,
        });
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn sequence_number(&self) -> Option<u32> {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, seqn: Option<u32>) {
        self.sequence_number = seqn;
    }

    pub fn rows(&self) -> &[PsvRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for PsvDocument {
    /// Writes the document back out in wire format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.schema)?;
        if let Some(seqn) = self.sequence_number {
            writeln!(f, "## seqn = {seqn}")?;
        }
        for row in &self.rows {
            writeln!(f, "{}", row.cells.join("|"))?;
        }
        Ok(())
    }
}

impl PsvRow {
    /// The raw cell at a column index.
    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    /// The raw cell under a column name.
    ///
    /// Errors if the schema has no such column. An empty cell is returned
    /// as an empty string; PSV has no other way to express absence.
    pub fn get(&self, column: &str) -> Result<&str> {
        let index = self
            .schema
            .column_index(column)
            .ok_or_else(|| Error::NoSuchColumn {
                name: column.to_string(),
            })?;
        Ok(&self.cells[index])
    }

    /// Like [`Self::get`], but treats a missing column as an empty cell.
    ///
    /// Endpoints differ in which optional columns they carry, so most row
    /// consumers want this form.
    pub fn get_or_default(&self, column: &str) -> &str {
        self.schema
            .column_index(column)
            .map(|i| self.cells[i].as_str())
            .unwrap_or("")
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }
}
