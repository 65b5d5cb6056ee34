// ABOUTME: Declarative source-table to Groonga-table mapping engine
// ABOUTME: Compiles column templates and type tags, generates typed records from rows

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use serde_json::{Map, Number, Value};

use crate::error::ReplicateError;

/// Raw mapping section of `config.yaml`: Groonga table name → sources.
pub type MappingSpec = BTreeMap<String, TargetTableSpec>;

#[derive(Debug, Clone, Deserialize)]
pub struct TargetTableSpec {
    #[serde(default)]
    pub sources: Vec<SourceTableSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceTableSpec {
    pub database: Option<String>,
    pub table: String,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,
}

/// A target column is either a bare template string or a template with a
/// Groonga type tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Template(String),
    Typed {
        template: String,
        #[serde(rename = "type")]
        type_tag: Option<String>,
    },
}

impl ColumnSpec {
    fn template(&self) -> &str {
        match self {
            ColumnSpec::Template(t) => t,
            ColumnSpec::Typed { template, .. } => template,
        }
    }

    fn type_tag(&self) -> Option<&str> {
        match self {
            ColumnSpec::Template(_) => None,
            ColumnSpec::Typed { type_tag, .. } => type_tag.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroongaType {
    ShortText,
    Text,
    LongText,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Bool,
}

impl GroongaType {
    fn parse(tag: &str) -> Result<Self, ReplicateError> {
        match tag {
            "ShortText" => Ok(GroongaType::ShortText),
            "Text" => Ok(GroongaType::Text),
            "LongText" => Ok(GroongaType::LongText),
            "Int8" => Ok(GroongaType::Int8),
            "Int16" => Ok(GroongaType::Int16),
            "Int32" => Ok(GroongaType::Int32),
            "Int64" => Ok(GroongaType::Int64),
            "UInt8" => Ok(GroongaType::UInt8),
            "UInt16" => Ok(GroongaType::UInt16),
            "UInt32" => Ok(GroongaType::UInt32),
            "UInt64" => Ok(GroongaType::UInt64),
            "Float" => Ok(GroongaType::Float),
            "Bool" => Ok(GroongaType::Bool),
            other => Err(ReplicateError::Configuration(format!(
                "unknown Groonga type: {other}"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            GroongaType::ShortText => "ShortText",
            GroongaType::Text => "Text",
            GroongaType::LongText => "LongText",
            GroongaType::Int8 => "Int8",
            GroongaType::Int16 => "Int16",
            GroongaType::Int32 => "Int32",
            GroongaType::Int64 => "Int64",
            GroongaType::UInt8 => "UInt8",
            GroongaType::UInt16 => "UInt16",
            GroongaType::UInt32 => "UInt32",
            GroongaType::UInt64 => "UInt64",
            GroongaType::Float => "Float",
            GroongaType::Bool => "Bool",
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A `%{column}` template compiled into literal and placeholder segments.
#[derive(Debug, Clone)]
struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(source: &str) -> Result<Self, ReplicateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        while let Some(start) = rest.find("%{") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                ReplicateError::Configuration(format!(
                    "malformed template {source:?}: unterminated %{{"
                ))
            })?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(after[..end].to_string()));
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Template { segments })
    }

    /// Substitutes row values into the template. Columns absent from the row
    /// render as the empty string.
    fn render(&self, row: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(column) => {
                    if let Some(value) = row.get(column) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }

    fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(column) => Some(column.as_str()),
            Segment::Literal(_) => None,
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledColumn {
    name: String,
    template: Template,
    type_tag: Option<GroongaType>,
}

#[derive(Debug, Clone)]
struct CompiledSource {
    groonga_table: String,
    columns: Vec<CompiledColumn>,
    referenced: HashSet<String>,
}

/// Compiled source-table → Groonga-table index.
///
/// Templates and type tags are validated eagerly so that a bad mapping fails
/// at startup instead of on the first matching row event.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    index: HashMap<String, CompiledSource>,
}

impl Mapping {
    pub fn from_spec(spec: &MappingSpec) -> Result<Self, ReplicateError> {
        let mut index = HashMap::new();
        for (groonga_table, details) in spec {
            for source in &details.sources {
                let mut columns = Vec::new();
                let mut referenced = HashSet::new();
                for (name, column_spec) in &source.columns {
                    let template = Template::parse(column_spec.template())?;
                    let type_tag = column_spec
                        .type_tag()
                        .map(GroongaType::parse)
                        .transpose()?;
                    referenced.extend(
                        template
                            .referenced_columns()
                            .map(|column| column.to_string()),
                    );
                    columns.push(CompiledColumn {
                        name: name.clone(),
                        template,
                        type_tag,
                    });
                }
                index.insert(
                    source.table.clone(),
                    CompiledSource {
                        groonga_table: groonga_table.clone(),
                        columns,
                        referenced,
                    },
                );
            }
        }
        Ok(Mapping { index })
    }

    /// The Groonga table a source table maps to, if any.
    pub fn groonga_table(&self, source_table: &str) -> Option<&str> {
        self.index
            .get(source_table)
            .map(|source| source.groonga_table.as_str())
    }

    /// Deduplicated set of source columns the templates for this table read.
    pub fn referenced_columns(&self, source_table: &str) -> Option<&HashSet<String>> {
        self.index.get(source_table).map(|source| &source.referenced)
    }

    /// Builds a Groonga record from one source row. Returns `None` when the
    /// source table has no mapping entry.
    pub fn generate_record(
        &self,
        source_table: &str,
        row: &HashMap<String, String>,
    ) -> Result<Option<Map<String, Value>>, ReplicateError> {
        let Some(source) = self.index.get(source_table) else {
            return Ok(None);
        };
        let mut record = Map::new();
        for column in &source.columns {
            let rendered = column.template.render(row);
            let value = cast(&column.name, rendered, column.type_tag)?;
            record.insert(column.name.clone(), value);
        }
        Ok(Some(record))
    }
}

fn cast(
    column: &str,
    value: String,
    type_tag: Option<GroongaType>,
) -> Result<Value, ReplicateError> {
    let Some(tag) = type_tag else {
        return Ok(Value::String(value));
    };
    let cast_error = |value: &str| ReplicateError::Cast {
        column: column.to_string(),
        type_tag: tag.name().to_string(),
        value: value.to_string(),
    };
    match tag {
        GroongaType::ShortText | GroongaType::Text | GroongaType::LongText => {
            Ok(Value::String(value))
        }
        GroongaType::Int8 | GroongaType::Int16 | GroongaType::Int32 | GroongaType::Int64 => {
            if value.is_empty() {
                return Ok(Value::Number(0.into()));
            }
            let parsed: i64 = value.parse().map_err(|_| cast_error(&value))?;
            Ok(Value::Number(parsed.into()))
        }
        GroongaType::UInt8 | GroongaType::UInt16 | GroongaType::UInt32 | GroongaType::UInt64 => {
            if value.is_empty() {
                return Ok(Value::Number(0.into()));
            }
            let parsed: u64 = value.parse().map_err(|_| cast_error(&value))?;
            Ok(Value::Number(parsed.into()))
        }
        GroongaType::Float => {
            if value.is_empty() {
                return Ok(Value::from(0.0));
            }
            let parsed: f64 = value.parse().map_err(|_| cast_error(&value))?;
            let number = Number::from_f64(parsed).ok_or_else(|| cast_error(&value))?;
            Ok(Value::Number(number))
        }
        GroongaType::Bool => {
            if value.is_empty() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(value != "0"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_from_yaml(yaml: &str) -> Mapping {
        let spec: MappingSpec = serde_yaml::from_str(yaml).unwrap();
        Mapping::from_spec(&spec).unwrap()
    }

    fn row(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const ITEMS_MAPPING: &str = r#"
items:
  sources:
    - database: shop
      table: shoes
      columns:
        _key: "shoes-%{id}"
        name: "%{name}"
        price:
          template: "%{price}"
          type: Int32
        in_stock:
          template: "%{in_stock}"
          type: Bool
"#;

    #[test]
    fn test_generate_record_with_key_template() {
        let mapping = mapping_from_yaml(ITEMS_MAPPING);
        let record = mapping
            .generate_record(
                "shoes",
                &row(&[
                    ("id", "1"),
                    ("name", "shoes a"),
                    ("price", "3000"),
                    ("in_stock", "1"),
                ]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(record["_key"], Value::String("shoes-1".into()));
        assert_eq!(record["name"], Value::String("shoes a".into()));
        assert_eq!(record["price"], Value::Number(3000.into()));
        assert_eq!(record["in_stock"], Value::Bool(true));
    }

    #[test]
    fn test_unmapped_table_generates_nothing() {
        let mapping = mapping_from_yaml(ITEMS_MAPPING);
        assert!(mapping
            .generate_record("hats", &row(&[("id", "1")]))
            .unwrap()
            .is_none());
        assert!(mapping.groonga_table("hats").is_none());
        assert_eq!(mapping.groonga_table("shoes"), Some("items"));
    }

    #[test]
    fn test_absent_column_renders_empty() {
        let mapping = mapping_from_yaml(ITEMS_MAPPING);
        let record = mapping
            .generate_record("shoes", &row(&[("name", "shoes a")]))
            .unwrap()
            .unwrap();
        assert_eq!(record["_key"], Value::String("shoes-".into()));
        // empty string through the Int32 cast
        assert_eq!(record["price"], Value::Number(0.into()));
        assert_eq!(record["in_stock"], Value::Bool(false));
    }

    #[test]
    fn test_referenced_columns_deduplicated() {
        let mapping = mapping_from_yaml(
            r#"
items:
  sources:
    - table: shoes
      columns:
        _key: "%{id}-%{id}"
        label: "%{id} %{name}"
"#,
        );
        let referenced = mapping.referenced_columns("shoes").unwrap();
        assert_eq!(referenced.len(), 2);
        assert!(referenced.contains("id"));
        assert!(referenced.contains("name"));
    }

    #[test]
    fn test_int_casts() {
        assert_eq!(
            cast("n", "42".into(), Some(GroongaType::Int32)).unwrap(),
            Value::Number(42.into())
        );
        assert_eq!(
            cast("n", "".into(), Some(GroongaType::Int64)).unwrap(),
            Value::Number(0.into())
        );
        assert_eq!(
            cast("n", "-7".into(), Some(GroongaType::Int8)).unwrap(),
            Value::Number((-7).into())
        );
        assert!(matches!(
            cast("n", "abc".into(), Some(GroongaType::Int32)),
            Err(ReplicateError::Cast { .. })
        ));
        assert!(matches!(
            cast("n", "-1".into(), Some(GroongaType::UInt32)),
            Err(ReplicateError::Cast { .. })
        ));
    }

    #[test]
    fn test_float_casts() {
        assert_eq!(
            cast("n", "1.5".into(), Some(GroongaType::Float)).unwrap(),
            Value::Number(Number::from_f64(1.5).unwrap())
        );
        assert_eq!(
            cast("n", "".into(), Some(GroongaType::Float)).unwrap(),
            Value::Number(Number::from_f64(0.0).unwrap())
        );
        assert!(matches!(
            cast("n", "1.5x".into(), Some(GroongaType::Float)),
            Err(ReplicateError::Cast { .. })
        ));
    }

    #[test]
    fn test_bool_casts() {
        assert_eq!(
            cast("b", "".into(), Some(GroongaType::Bool)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            cast("b", "0".into(), Some(GroongaType::Bool)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            cast("b", "1".into(), Some(GroongaType::Bool)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            cast("b", "anything".into(), Some(GroongaType::Bool)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_text_passthrough() {
        for tag in [None, Some(GroongaType::ShortText), Some(GroongaType::Text)] {
            assert_eq!(
                cast("t", "as-is".into(), tag).unwrap(),
                Value::String("as-is".into())
            );
            assert_eq!(cast("t", "".into(), tag).unwrap(), Value::String("".into()));
        }
    }

    #[test]
    fn test_unknown_type_tag_rejected_at_compile() {
        let spec: MappingSpec = serde_yaml::from_str(
            r#"
items:
  sources:
    - table: shoes
      columns:
        price:
          template: "%{price}"
          type: Decimal
"#,
        )
        .unwrap();
        assert!(matches!(
            Mapping::from_spec(&spec),
            Err(ReplicateError::Configuration(_))
        ));
    }

    #[test]
    fn test_unterminated_template_rejected() {
        let spec: MappingSpec = serde_yaml::from_str(
            r#"
items:
  sources:
    - table: shoes
      columns:
        _key: "shoes-%{id"
"#,
        )
        .unwrap();
        assert!(matches!(
            Mapping::from_spec(&spec),
            Err(ReplicateError::Configuration(_))
        ));
    }
}
