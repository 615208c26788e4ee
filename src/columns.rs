//! Column model for search projections.
//!
//! Callers ask for contact columns; the directory speaks attribute names.
//! The mapping between the two lives in a per-projection table that the
//! configuration may override entry by entry. Columns without a mapping in
//! the active projection are skipped silently.

use std::collections::HashMap;

use clap::ValueEnum;
use serde::Deserialize;

/// A requestable contact column, shared between the CLI and the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Column {
    DisplayName,
    GivenName,
    Surname,
    Email1,
    Email2,
    Company,
    Department,
    Title,
    Phone,
    Mobile,
    Uid,
    Members,
    Note,
}

/// Selects which attribute table a search projects through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    User,
    DistributionList,
}

/// Column-to-attribute tables for both projections.
#[derive(Debug)]
pub struct AttributeMap {
    user: HashMap<Column, String>,
    list: HashMap<Column, String>,
}

fn default_user_table() -> HashMap<Column, String> {
    [
        (Column::DisplayName, "displayName"),
        (Column::GivenName, "givenName"),
        (Column::Surname, "sn"),
        (Column::Email1, "mail"),
        (Column::Company, "o"),
        (Column::Department, "departmentNumber"),
        (Column::Title, "title"),
        (Column::Phone, "telephoneNumber"),
        (Column::Mobile, "mobile"),
        (Column::Uid, "uid"),
        (Column::Note, "description"),
    ]
    .into_iter()
    .map(|(c, a)| (c, a.to_owned()))
    .collect()
}

fn default_list_table() -> HashMap<Column, String> {
    [
        (Column::DisplayName, "cn"),
        (Column::Email1, "mail"),
        (Column::Uid, "uid"),
        (Column::Members, "member"),
    ]
    .into_iter()
    .map(|(c, a)| (c, a.to_owned()))
    .collect()
}

impl Default for AttributeMap {
    fn default() -> Self {
        Self {
            user: default_user_table(),
            list: default_list_table(),
        }
    }
}

impl AttributeMap {
    /// Builds the map from the built-in tables with config overrides applied
    /// on top. An override may add a mapping the defaults do not carry (e.g.
    /// `email2 = "mailAlternateAddress"`).
    pub fn with_overrides(
        user: &HashMap<Column, String>,
        list: &HashMap<Column, String>,
    ) -> Self {
        let mut map = Self::default();
        map.user.extend(user.iter().map(|(c, a)| (*c, a.clone())));
        map.list.extend(list.iter().map(|(c, a)| (*c, a.clone())));
        map
    }

    fn table(&self, projection: Projection) -> &HashMap<Column, String> {
        match projection {
            Projection::User => &self.user,
            Projection::DistributionList => &self.list,
        }
    }

    /// Looks up the attribute name for one column, `None` if unmapped.
    pub fn attribute(&self, projection: Projection, column: Column) -> Option<&str> {
        self.table(projection).get(&column).map(String::as_str)
    }

    /// Translates a requested column set into attribute names, preserving
    /// request order. Unmapped columns are dropped; duplicate columns (or two
    /// columns mapped to the same attribute) yield the attribute once.
    pub fn attributes(&self, projection: Projection, columns: &[Column]) -> Vec<String> {
        let table = self.table(projection);
        let mut attrs: Vec<String> = Vec::with_capacity(columns.len());

        for column in columns {
            if let Some(attr) = table.get(column) {
                if !attrs.iter().any(|a| a == attr) {
                    attrs.push(attr.clone());
                }
            } else {
                debug!("column {column:?} has no attribute mapping, skipping");
            }
        }

        attrs
    }
}
