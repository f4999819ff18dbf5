//! Header schemas

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::field_type::FieldType;

/// A single typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub index: usize,
}

/// The ordered set of typed columns declared by a PSV header line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    /// Parse a header line such as
    /// `Region!STRING:0|BuildConfig!HEX:16|BuildId!DEC:4`.
    pub fn parse_header(line: &str) -> Result<Self> {
        let mut schema = Schema::default();

        for spec in line.split('|') {
            let Some((name, type_spec)) = spec.split_once('!') else {
                return Err(Error::InvalidHeader {
                    reason: format!("column {spec:?} has no type specification"),
                });
            };
            schema.add_field(name.trim(), FieldType::parse(type_spec)?)?;
        }

        if schema.fields.is_empty() {
            return Err(Error::InvalidHeader {
                reason: "no columns".to_string(),
            });
        }

        Ok(schema)
    }

    pub fn add_field(&mut self, name: &str, field_type: FieldType) -> Result<()> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateColumn {
                name: name.to_string(),
            });
        }

        let index = self.fields.len();
        self.by_name.insert(name.to_string(), index);
        self.fields.push(Field {
            name: name.to_string(),
            field_type,
            index,
        });
        Ok(())
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Index of the named column, if it exists.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

impl fmt::Display for Schema {
    /// Formats the schema back into a header line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}!{}", field.name, field.field_type)?;
        }
        Ok(())
    }
}
