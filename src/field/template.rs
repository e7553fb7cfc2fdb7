use std::collections::HashMap;

use super::DataField;
use crate::error::{Error, Result};

/// The catalog of named field templates referenced by type name from
/// message definitions. Template names are case-insensitive.
#[derive(Debug, Default)]
pub struct Templates {
    by_name: HashMap<String, DataField>,
}

impl Templates {
    pub fn new() -> Templates {
        Templates::default()
    }

    /// Installs a template. An existing name is rejected with
    /// [`Error::DuplicateName`] unless `replace` is set.
    pub fn add(&mut self, name: &str, field: DataField, replace: bool) -> Result<()> {
        let key = name.to_lowercase();
        if key.is_empty() {
            return Err(Error::invalid_arg("template without a name"));
        }
        if !replace && self.by_name.contains_key(&key) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        self.by_name.insert(key, field);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DataField> {
        self.by_name.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DataField, Row};
    use super::*;

    fn template_row(name: &str, type_name: &str) -> Vec<Row> {
        let mut row = Row::new();
        row.insert("name".to_string(), name.to_string());
        row.insert("type".to_string(), type_name.to_string());
        vec![row]
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut templates = Templates::new();
        let field = DataField::create(template_row("temp", "D2B"), &templates, false, true, false)
            .unwrap();
        templates.add("temp", field.clone(), false).unwrap();
        assert_eq!(
            templates.add("TEMP", field.clone(), false),
            Err(Error::DuplicateName("TEMP".to_string()))
        );
        templates.add("TEMP", field, true).unwrap();
        assert_eq!(templates.len(), 1);
        assert!(templates.get("Temp").is_some());
    }

    #[test]
    fn template_chains_resolve() {
        let mut templates = Templates::new();
        let temp = DataField::create(template_row("temp", "D2B"), &templates, false, true, false)
            .unwrap();
        templates.add("temp", temp, false).unwrap();
        // a template referencing a template
        let pair = DataField::create(
            template_row("tpair", "temp;temp"),
            &templates,
            false,
            true,
            false,
        )
        .unwrap();
        assert_eq!(pair.fields().len(), 2);
        templates.add("tpair", pair, false).unwrap();
        let through = DataField::create(
            template_row("x", "tpair"),
            &templates,
            false,
            false,
            true,
        )
        .unwrap();
        assert_eq!(through.fields().len(), 2);
    }
}
