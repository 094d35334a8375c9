//! Asserted attributes and their translation into local account fields.
//!
//! IdPs name the same attribute differently (`mail`,
//! `urn:oid:0.9.2342.19200300.100.1.3`, ...), so each IdP carries its own
//! [`AttributeMapping`] from attribute name to [`LocalField`].

use std::{collections::BTreeMap, fmt::Display};

use serde::Deserialize;

use crate::BindingFailure;

/// Attribute statement of an assertion: name to ordered values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, Vec<String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    pub fn with<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(name, values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)?.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalField {
    Email,
    UniqueId,
    FullName,
    GivenName,
    Surname,
    DisplayName,
    Username,
}

impl Display for LocalField {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            LocalField::Email => "email",
            LocalField::UniqueId => "unique_id",
            LocalField::FullName => "full_name",
            LocalField::GivenName => "given_name",
            LocalField::Surname => "surname",
            LocalField::DisplayName => "display_name",
            LocalField::Username => "username",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiValuePolicy {
    #[default]
    First,
    Reject,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttributeMapping {
    by_name: BTreeMap<String, LocalField>,
}

impl AttributeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, attribute: impl Into<String>, field: LocalField) -> Self {
        self.by_name.insert(attribute.into(), field);
        self
    }

    pub fn maps_field(&self, field: LocalField) -> bool {
        self.by_name.values().any(|f| *f == field)
    }

    /// Translates recognized attributes; everything else lands in `unmapped`.
    pub fn apply(
        &self,
        attributes: &Attributes,
        policy: MultiValuePolicy,
    ) -> Result<MappedAttributes, BindingFailure> {
        let mut mapped = MappedAttributes::default();
        for (name, values) in attributes.iter() {
            let Some(field) = self.by_name.get(name) else {
                mapped.unmapped.insert(name.to_string(), values.to_vec());
                continue;
            };
            if values.len() > 1 && policy == MultiValuePolicy::Reject {
                return Err(BindingFailure::AmbiguousAttribute(name.to_string()));
            }
            let Some(value) = values.iter().map(|v| v.trim()).find(|v| !v.is_empty()) else {
                continue;
            };
            // Two attribute names mapped onto one field: first in name order wins.
            mapped.fields.entry(*field).or_insert_with(|| value.to_string());
        }
        Ok(mapped)
    }
}

impl FromIterator<(String, LocalField)> for AttributeMapping {
    fn from_iter<T: IntoIterator<Item = (String, LocalField)>>(iter: T) -> Self {
        Self {
            by_name: iter.into_iter().collect(),
        }
    }
}

/// Attributes after mapping: typed local fields plus the uninterpreted rest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MappedAttributes {
    fields: BTreeMap<LocalField, String>,
    pub unmapped: BTreeMap<String, Vec<String>>,
}

impl MappedAttributes {
    pub fn get(&self, field: LocalField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn email(&self) -> Option<&str> {
        self.get(LocalField::Email)
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self
            .get(LocalField::DisplayName)
            .or_else(|| self.get(LocalField::FullName))
        {
            return Some(name.to_string());
        }
        match (self.get(LocalField::GivenName), self.get(LocalField::Surname)) {
            (Some(given), Some(surname)) => Some(format!("{given} {surname}")),
            (Some(name), None) | (None, Some(name)) => Some(name.to_string()),
            (None, None) => None,
        }
    }

    /// Explicit username, else the local part of the unique id or email.
    pub fn username(&self) -> Option<String> {
        if let Some(username) = self.get(LocalField::Username) {
            return Some(username.to_string());
        }
        self.get(LocalField::UniqueId)
            .or_else(|| self.email())
            .and_then(|id| id.split('@').next())
            .filter(|local| !local.is_empty())
            .map(str::to_string)
    }

    pub fn missing(&self, required: &[LocalField]) -> Vec<LocalField> {
        required
            .iter()
            .copied()
            .filter(|field| !self.fields.contains_key(field))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> AttributeMapping {
        AttributeMapping::new()
            .map("email_mapping", LocalField::Email)
            .map("id_mapping", LocalField::UniqueId)
            .map("full_name_mapping", LocalField::FullName)
    }

    #[test]
    fn can_map_attributes() {
        let attributes = Attributes::new()
            .with("email_mapping", ["test@hzdr.de"])
            .with("id_mapping", ["test123@hzdr.de"])
            .with("full_name_mapping", ["Test Tester"])
            .with("urn:oid:2.5.4.11", ["FWCC"]);

        let mapped = mapping()
            .apply(&attributes, MultiValuePolicy::First)
            .unwrap();
        assert_eq!(mapped.email(), Some("test@hzdr.de"));
        assert_eq!(mapped.display_name().as_deref(), Some("Test Tester"));
        assert_eq!(mapped.username().as_deref(), Some("test123"));
        assert_eq!(
            mapped.unmapped.get("urn:oid:2.5.4.11"),
            Some(&vec!["FWCC".to_string()])
        );
    }

    #[test]
    fn multi_valued_attributes_use_first_value() {
        let attributes = Attributes::new().with("email_mapping", ["a@x.org", "b@x.org"]);
        let mapped = mapping()
            .apply(&attributes, MultiValuePolicy::First)
            .unwrap();
        assert_eq!(mapped.email(), Some("a@x.org"));

        assert_eq!(
            mapping().apply(&attributes, MultiValuePolicy::Reject),
            Err(BindingFailure::AmbiguousAttribute("email_mapping".into()))
        );
    }

    #[test]
    fn reports_missing_fields() {
        let attributes = Attributes::new().with("full_name_mapping", ["  "]);
        let mapped = mapping()
            .apply(&attributes, MultiValuePolicy::First)
            .unwrap();
        assert_eq!(
            mapped.missing(&[LocalField::Email, LocalField::FullName]),
            vec![LocalField::Email, LocalField::FullName]
        );
    }
}
