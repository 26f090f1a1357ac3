use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Language the proposal is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalLanguage {
    /// Spanish (`es`)
    #[default]
    Spanish,
    /// English (`en`)
    English,
}

impl ProposalLanguage {
    /// Parses a language code or name; unknown values yield `None`.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "es" | "spa" | "spanish" | "español" | "espanol" => Some(Self::Spanish),
            "en" | "eng" | "english" | "inglés" | "ingles" => Some(Self::English),
            _ => None,
        }
    }

    /// Returns the two-letter code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Spanish => "es",
            Self::English => "en",
        }
    }
}

impl fmt::Display for ProposalLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Caller-supplied project record injected verbatim into prompts.
///
/// Keys are free-form; the prompt templates know about `title`, `country`,
/// `department`, `municipality`, `donor`, `duration_months`,
/// `beneficiaries_direct`, `org_profile` and a few more, and list any other
/// key as additional information. The record is read-only during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectMetadata {
    fields: BTreeMap<String, Value>,
}

impl ProjectMetadata {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parses a JSON object.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the text is not a JSON object.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON object from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&json)
    }

    /// Returns the raw value of a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a field rendered as text.
    ///
    /// Strings are returned as-is, numbers and booleans are formatted,
    /// arrays are joined with `, `. Null and blank values yield `None`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(display_value)
    }

    /// Returns the project title.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        self.get_str("title")
    }

    /// Returns the donor name.
    #[must_use]
    pub fn donor(&self) -> Option<String> {
        self.get_str("donor")
    }

    /// Returns the project duration in months, when numeric.
    #[must_use]
    pub fn duration_months(&self) -> Option<f64> {
        match self.fields.get("duration_months")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the number of direct beneficiaries, 0 when unknown.
    ///
    /// Free text such as `"1,200 familias"` yields its first number.
    #[must_use]
    pub fn beneficiaries_direct(&self) -> u64 {
        self.head_count("beneficiaries_direct")
    }

    /// Returns the number of indirect beneficiaries, 0 when unknown.
    #[must_use]
    pub fn beneficiaries_indirect(&self) -> u64 {
        self.head_count("beneficiaries_indirect")
    }

    fn head_count(&self, key: &str) -> u64 {
        match self.fields.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
                .unwrap_or(0),
            Some(Value::String(s)) => {
                let digits: String = s
                    .chars()
                    .filter(|c| !matches!(c, ',' | '.'))
                    .skip_while(|c| !c.is_ascii_digit())
                    .take_while(char::is_ascii_digit)
                    .collect();
                digits.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Returns the proposal language (`language` field), Spanish by default.
    #[must_use]
    pub fn language(&self) -> ProposalLanguage {
        self.get_str("language")
            .and_then(|code| ProposalLanguage::from_code(&code))
            .unwrap_or_default()
    }

    /// Returns every non-blank field rendered as text.
    #[must_use]
    pub fn display_fields(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(key, value)| display_value(value).map(|text| (key.clone(), text)))
            .collect()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn display_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use serde_json::json;

    #[test]
    fn test_accessors() {
        let project = ProjectMetadata::new()
            .with("title", "Agua segura para Chiquimula")
            .with("donor", "USAID")
            .with("duration_months", 24)
            .with("language", "en")
            .with("partners", json!(["COCODE", "Municipalidad"]))
            .with("notes", Value::Null);

        assert_eq!(project.title().as_deref(), Some("Agua segura para Chiquimula"));
        assert_eq!(project.donor().as_deref(), Some("USAID"));
        assert_eq!(project.duration_months(), Some(24.0));
        assert_eq!(project.language(), ProposalLanguage::English);
        assert_eq!(project.get_str("partners").as_deref(), Some("COCODE, Municipalidad"));
        assert_eq!(project.get_str("notes"), None);
        assert_eq!(project.len(), 6);
    }

    #[test]
    fn test_beneficiary_counts() {
        let project = ProjectMetadata::new()
            .with("beneficiaries_direct", "1,200 familias")
            .with("beneficiaries_indirect", 4500);

        assert_eq!(project.beneficiaries_direct(), 1200);
        assert_eq!(project.beneficiaries_indirect(), 4500);
        assert_eq!(ProjectMetadata::new().beneficiaries_direct(), 0);
        assert_eq!(
            ProjectMetadata::new()
                .with("beneficiaries_direct", "por definir")
                .beneficiaries_direct(),
            0
        );
    }

    #[test]
    fn test_defaults() {
        let project = ProjectMetadata::new();
        assert!(project.is_empty());
        assert_eq!(project.language(), ProposalLanguage::Spanish);
        assert_eq!(project.title(), None);
    }

    #[test]
    fn test_duration_from_string() {
        let project = ProjectMetadata::new().with("duration_months", " 18 ");
        assert_eq!(project.duration_months(), Some(18.0));
    }

    #[test]
    fn test_display_fields_skip_blank() {
        let project = ProjectMetadata::new()
            .with("title", "  ")
            .with("country", "Guatemala")
            .with("budget_cap", 250_000);

        let fields = project.display_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["budget_cap"], "250000");
    }

    #[test]
    fn test_from_json() {
        let project = ProjectMetadata::from_json_str(r#"{"title": "T", "donor": "GIZ"}"#).unwrap();
        assert_eq!(project.donor().as_deref(), Some("GIZ"));

        assert!(ProjectMetadata::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("project.json");
        file.write_str(r#"{"title": "Proyecto", "language": "es"}"#).unwrap();

        let project = ProjectMetadata::from_json_file(file.path()).unwrap();
        assert_eq!(project.title().as_deref(), Some("Proyecto"));

        let missing = ProjectMetadata::from_json_file(&temp.path().join("none.json"));
        assert!(matches!(missing, Err(Error::Io { .. })));
    }

    #[test]
    fn test_language_codes() {
        assert_eq!(ProposalLanguage::from_code("ES"), Some(ProposalLanguage::Spanish));
        assert_eq!(ProposalLanguage::from_code("english"), Some(ProposalLanguage::English));
        assert_eq!(ProposalLanguage::from_code("fr"), None);
        assert_eq!(ProposalLanguage::English.to_string(), "en");
    }
}
