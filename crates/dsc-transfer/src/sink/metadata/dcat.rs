//! DCAT-AP dataset documents
//!
//! Incoming metadata is a JSON object describing one dataset. It is checked
//! here and rendered as Turtle for a Piveau-style hub repository.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Write;

pub const DEFAULT_THEME: &str = "TECH";
pub const DEFAULT_LICENSE: &str = "https://creativecommons.org/licenses/by/4.0/";
pub const DATA_THEME_AUTHORITY: &str =
    "http://publications.europa.eu/resource/authority/data-theme/";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Dataset description as supplied by the data provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub catalogue: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(
        default,
        rename = "record_count",
        alias = "recordCount",
        deserialize_with = "string_or_number"
    )]
    pub record_count: Option<String>,
    #[serde(default, rename = "file_format", alias = "fileFormat")]
    pub file_format: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default, rename = "number_of_files", alias = "numberOfFiles")]
    pub number_of_files: Option<u32>,
}

/// Metadata with every default applied and every rule checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub theme: String,
    pub license: String,
    pub issued: String,
    pub modified: String,
    pub publisher: Option<String>,
    pub columns: Vec<String>,
}

impl DatasetMetadata {
    /// The document must be a JSON object; arrays would otherwise map onto
    /// the fields by position.
    pub fn parse(document: &[u8]) -> std::result::Result<Self, String> {
        let value: serde_json::Value = serde_json::from_slice(document)
            .map_err(|e| format!("metadata document is not valid JSON: {e}"))?;
        if !value.is_object() {
            return Err(format!(
                "metadata document must be a JSON object, got {}",
                json_kind(&value)
            ));
        }
        serde_json::from_value(value).map_err(|e| format!("metadata document is not valid: {e}"))
    }

    /// Apply defaults and check the document. `dataset_id` from the sink
    /// configuration wins over the one in the document. All violations are
    /// reported together.
    pub fn resolve(
        self,
        dataset_id: Option<&str>,
        today: NaiveDate,
    ) -> std::result::Result<Dataset, String> {
        let mut violations = Vec::new();

        let id = dataset_id
            .map(str::to_string)
            .or(self.dataset_id)
            .map(|id| id.trim().to_string())
            .unwrap_or_default();
        if id.is_empty() {
            violations.push("a dataset id is required".to_string());
        } else if id.chars().any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#')) {
            violations.push(format!("dataset id '{id}' must be a single URL path segment"));
        }

        let title = self.title.unwrap_or_else(|| id.clone());
        if title.trim().is_empty() {
            violations.push("title must not be empty".to_string());
        }
        let description = self.description.unwrap_or_else(|| title.clone());

        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            violations.push("keywords must be non-empty strings".to_string());
        }
        let columns = self.columns.unwrap_or_default();
        if columns.iter().any(|c| c.trim().is_empty()) {
            violations.push("columns must be non-empty strings".to_string());
        }

        let theme = self.theme.unwrap_or_else(|| DEFAULT_THEME.to_string());
        if theme.is_empty()
            || !theme
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            violations.push(format!("theme '{theme}' is not a data-theme code"));
        }

        let license = self.license.unwrap_or_else(|| DEFAULT_LICENSE.to_string());
        if url::Url::parse(&license).is_err() {
            violations.push(format!("license '{license}' is not an absolute URL"));
        }

        let today = today.format(DATE_FORMAT).to_string();
        let issued = self.issued.unwrap_or_else(|| today.clone());
        let modified = self.modified.unwrap_or(today);
        for (field, value) in [("issued", &issued), ("modified", &modified)] {
            if NaiveDate::parse_from_str(value, DATE_FORMAT).is_err() {
                violations.push(format!("{field} '{value}' is not a YYYY-MM-DD date"));
            }
        }

        if !violations.is_empty() {
            return Err(violations.join("; "));
        }

        Ok(Dataset {
            id,
            title,
            description,
            keywords: self.keywords,
            theme,
            license,
            issued,
            modified,
            publisher: self.publisher.filter(|p| !p.is_empty()),
            columns,
        })
    }
}

impl Dataset {
    pub fn uri(&self, api_url: &str) -> String {
        format!("{api_url}/{}", self.id)
    }

    /// `dcat:Dataset` in Turtle. `dct:license` closes the statement.
    pub fn to_turtle(&self, api_url: &str) -> String {
        let mut out = String::new();
        for (prefix, iri) in [
            ("dcat", "http://www.w3.org/ns/dcat#"),
            ("dct", "http://purl.org/dc/terms/"),
            ("foaf", "http://xmlns.com/foaf/0.1/"),
            ("vcard", "http://www.w3.org/2006/vcard/ns#"),
            ("adms", "http://www.w3.org/ns/adms#"),
            ("schema", "http://schema.org/"),
            ("skos", "http://www.w3.org/2004/02/skos/core#"),
            ("prov", "http://www.w3.org/ns/prov#"),
            ("xsd", "http://www.w3.org/2001/XMLSchema#"),
        ] {
            let _ = writeln!(out, "@prefix {:<7} <{iri}> .", format!("{prefix}:"));
        }
        out.push('\n');

        let _ = writeln!(out, "<{}>", self.uri(api_url));
        push_property(&mut out, "a", "dcat:Dataset");
        push_property(&mut out, "dct:title", &lang_literal(&self.title));
        push_property(&mut out, "dct:description", &lang_literal(&self.description));
        push_property(&mut out, "dct:issued", &date_literal(&self.issued));
        push_property(&mut out, "dct:modified", &date_literal(&self.modified));
        push_property(
            &mut out,
            "dcat:theme",
            &format!("<{DATA_THEME_AUTHORITY}{}>", self.theme),
        );
        if !self.keywords.is_empty() {
            push_property(&mut out, "dcat:keyword", &literal_list(&self.keywords));
        }
        if !self.columns.is_empty() {
            push_property(&mut out, "schema:variableMeasured", &literal_list(&self.columns));
        }
        if let Some(publisher) = &self.publisher {
            push_property(
                &mut out,
                "dct:publisher",
                &format!("[ a foaf:Agent ; foaf:name {} ]", literal(publisher)),
            );
        }
        let _ = writeln!(out, "    {:<23} <{}> .", "dct:license", self.license);
        out
    }
}

/// `dcat:Distribution` for one file of a published dataset.
pub fn distribution_turtle(api_url: &str, dataset_id: &str, file_name: &str, issued: &str) -> String {
    let uri = format!(
        "{api_url}/{dataset_id}/distributions/{}",
        distribution_id(file_name)
    );

    let mut out = String::new();
    out.push_str("@prefix dcat:   <http://www.w3.org/ns/dcat#> .\n");
    out.push_str("@prefix dct:    <http://purl.org/dc/terms/> .\n");
    out.push_str("@prefix xsd:    <http://www.w3.org/2001/XMLSchema#> .\n\n");
    let _ = writeln!(out, "<{uri}>");
    push_property(&mut out, "a", "dcat:Distribution");
    push_property(&mut out, "dct:title", &lang_literal(file_name));
    push_property(
        &mut out,
        "dct:description",
        &lang_literal(&format!("Data distribution for {file_name}")),
    );
    push_property(&mut out, "dcat:accessURL", &format!("<{uri}>"));
    push_property(&mut out, "dct:format", &literal(&detect_format(file_name)));
    push_property(&mut out, "dcat:mediaType", &literal(detect_media_type(file_name)));
    push_property(&mut out, "dct:issued", &date_literal(issued));
    let _ = writeln!(out, "    {:<23} {} .", "dct:modified", date_literal(issued));
    out
}

/// File stem, lower-cased, with runs of anything but `[a-z0-9]` collapsed
/// to `-`.
pub fn distribution_id(file_name: &str) -> String {
    let stem = match file_name.rfind('.') {
        Some(dot) if dot > 0 => &file_name[..dot],
        _ => file_name,
    };

    let mut id = String::with_capacity(stem.len());
    for c in stem.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            id.push(c);
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

pub fn detect_format(file_name: &str) -> String {
    let ext = extension(file_name);
    match ext.as_str() {
        "csv" => "CSV".into(),
        "json" => "JSON".into(),
        "xml" => "XML".into(),
        "xlsx" | "xls" => "XLSX".into(),
        "pdf" => "PDF".into(),
        other => other.to_uppercase(),
    }
}

pub fn detect_media_type(file_name: &str) -> &'static str {
    match extension(file_name).as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn extension(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => file_name[dot + 1..].to_lowercase(),
        _ => String::new(),
    }
}

pub fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

fn push_property(out: &mut String, predicate: &str, object: &str) {
    let _ = writeln!(out, "    {predicate:<23} {object} ;");
}

fn literal(value: &str) -> String {
    format!("\"{}\"", escape(value))
}

fn lang_literal(value: &str) -> String {
    format!("{}@en", literal(value))
}

fn date_literal(value: &str) -> String {
    format!("\"{value}\"^^xsd:date")
}

fn literal_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| literal(v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Count>::deserialize(deserializer)?.map(|count| match count {
        Count::Text(s) => s,
        Count::Number(n) => n.to_string(),
    }))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_defaults_follow_dataset_id() {
        let metadata = DatasetMetadata::parse(br#"{"datasetId": "air-quality"}"#).unwrap();
        let dataset = metadata.resolve(None, today()).unwrap();

        assert_eq!(dataset.title, "air-quality");
        assert_eq!(dataset.description, "air-quality");
        assert_eq!(dataset.theme, DEFAULT_THEME);
        assert_eq!(dataset.license, DEFAULT_LICENSE);
        assert_eq!(dataset.issued, "2026-03-14");
        assert_eq!(dataset.modified, "2026-03-14");
    }

    #[test]
    fn test_aliases_and_loose_counts() {
        let metadata = DatasetMetadata::parse(
            br#"{"recordCount": 1200, "numberOfFiles": 3, "fileFormat": "csv", "keywords": null}"#,
        )
        .unwrap();
        assert_eq!(metadata.record_count.as_deref(), Some("1200"));
        assert_eq!(metadata.number_of_files, Some(3));
        assert_eq!(metadata.file_format.as_deref(), Some("csv"));
        assert!(metadata.keywords.is_empty());
    }

    #[test]
    fn test_configured_id_wins() {
        let metadata = DatasetMetadata::parse(br#"{"datasetId": "from-doc", "title": "T"}"#).unwrap();
        let dataset = metadata.resolve(Some("from-sink"), today()).unwrap();
        assert_eq!(dataset.id, "from-sink");
    }

    #[test]
    fn test_violations_are_collected() {
        let metadata = DatasetMetadata::parse(
            br#"{"theme": "tech", "license": "cc-by", "issued": "14/03/2026", "keywords": [""]}"#,
        )
        .unwrap();
        let err = metadata.resolve(None, today()).unwrap_err();

        assert!(err.contains("dataset id is required"));
        assert!(err.contains("theme 'tech'"));
        assert!(err.contains("license 'cc-by'"));
        assert!(err.contains("issued '14/03/2026'"));
        assert!(err.contains("keywords"));
    }

    #[test]
    fn test_wrong_field_type_is_rejected() {
        assert!(DatasetMetadata::parse(br#"{"keywords": "energy"}"#).is_err());
        assert!(DatasetMetadata::parse(br#"["not", "an", "object"]"#).is_err());
    }

    #[test]
    fn test_positional_array_is_rejected() {
        let err = DatasetMetadata::parse(br#"["air-quality", "Air quality", "Hourly readings"]"#)
            .unwrap_err();
        assert!(err.contains("must be a JSON object"), "{err}");
        assert!(DatasetMetadata::parse(b"\"air-quality\"").is_err());
        assert!(DatasetMetadata::parse(b"null").is_err());
        assert!(DatasetMetadata::parse(br#"{"datasetId": "air-quality"}"#).is_ok());
    }

    #[test]
    fn test_dataset_turtle() {
        let metadata = DatasetMetadata::parse(
            br#"{
                "title": "Air \"quality\"",
                "description": "Hourly\nreadings",
                "keywords": ["air", "no2"],
                "columns": ["station", "value"],
                "publisher": "City Lab",
                "issued": "2026-01-02"
            }"#,
        )
        .unwrap();
        let turtle = metadata
            .resolve(Some("air-quality"), today())
            .unwrap()
            .to_turtle("https://hub.example/datasets");

        assert!(turtle.starts_with("@prefix dcat:   <http://www.w3.org/ns/dcat#> .\n"));
        assert!(turtle.contains("@prefix xsd:    <http://www.w3.org/2001/XMLSchema#> .\n\n"));
        assert!(turtle.contains("<https://hub.example/datasets/air-quality>\n"));
        assert!(turtle.contains("    a                       dcat:Dataset ;\n"));
        assert!(turtle.contains("    dct:title               \"Air \\\"quality\\\"\"@en ;\n"));
        assert!(turtle.contains("\"Hourly\\nreadings\"@en"));
        assert!(turtle.contains("    dct:issued              \"2026-01-02\"^^xsd:date ;\n"));
        assert!(turtle.contains("    dct:modified            \"2026-03-14\"^^xsd:date ;\n"));
        assert!(turtle.contains("<http://publications.europa.eu/resource/authority/data-theme/TECH>"));
        assert!(turtle.contains("    dcat:keyword            \"air\", \"no2\" ;\n"));
        assert!(turtle.contains("    schema:variableMeasured \"station\", \"value\" ;\n"));
        assert!(turtle.contains("[ a foaf:Agent ; foaf:name \"City Lab\" ]"));
        assert!(turtle.ends_with(
            "    dct:license             <https://creativecommons.org/licenses/by/4.0/> .\n"
        ));
    }

    #[test]
    fn test_distribution_naming() {
        assert_eq!(distribution_id("Air Quality 2026.CSV"), "air-quality-2026");
        assert_eq!(distribution_id("__data__.json"), "data");
        assert_eq!(distribution_id(".hidden"), "hidden");
        assert_eq!(detect_format("a.xls"), "XLSX");
        assert_eq!(detect_format("a.parquet"), "PARQUET");
        assert_eq!(detect_format("README"), "");
        assert_eq!(detect_media_type("a.xlsx"), "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet");
        assert_eq!(detect_media_type("a.bin"), "application/octet-stream");
    }

    #[test]
    fn test_distribution_turtle() {
        let turtle = distribution_turtle("https://hub.example/datasets", "air", "readings.csv", "2026-03-14");
        assert!(turtle.contains("<https://hub.example/datasets/air/distributions/readings>\n"));
        assert!(turtle.contains("    dct:format              \"CSV\" ;\n"));
        assert!(turtle.contains("    dcat:mediaType          \"text/csv\" ;\n"));
        assert!(turtle.ends_with("    dct:modified            \"2026-03-14\"^^xsd:date .\n"));
    }
}
