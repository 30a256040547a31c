//! Read access to the hierarchical data container of a run.
//!
//! A container is a tree of groups whose leaves are typed datasets. Paths are
//! `/` separated and relative to the run entry, the first top-level group of
//! the file. A container is owned by a single extraction call and dropped
//! before that call returns.
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl Dataset {
    pub fn len(&self) -> usize {
        match self {
            Dataset::Text(values) => values.len(),
            Dataset::Int(values) => values.len(),
            Dataset::Float(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_text(&self) -> Option<String> {
        match self {
            Dataset::Text(values) => values.first().cloned(),
            Dataset::Int(values) => values.first().map(ToString::to_string),
            Dataset::Float(values) => values.first().map(ToString::to_string),
        }
    }

    pub fn first_int(&self) -> Option<i64> {
        match self {
            Dataset::Int(values) => values.first().copied(),
            Dataset::Float(values) => values
                .first()
                .filter(|value| value.fract() == 0.0)
                .map(|value| *value as i64),
            Dataset::Text(values) => values.first().and_then(|value| value.trim().parse().ok()),
        }
    }

    pub fn first_float(&self) -> Option<f64> {
        self.floats().first().copied()
    }

    pub fn first_bool(&self) -> Option<bool> {
        match self {
            Dataset::Int(values) => values.first().map(|value| *value != 0),
            Dataset::Float(values) => values.first().map(|value| *value != 0.0),
            Dataset::Text(values) => values.first().and_then(|value| {
                match value.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                }
            }),
        }
    }

    /// Every value as a float. Text values that are not numbers are dropped.
    pub fn floats(&self) -> Vec<f64> {
        match self {
            Dataset::Int(values) => values.iter().map(|value| *value as f64).collect(),
            Dataset::Float(values) => values.clone(),
            Dataset::Text(values) => values
                .iter()
                .filter_map(|value| value.trim().parse().ok())
                .collect(),
        }
    }
}

pub trait Container: Send {
    /// The dataset at `path`, or `None` if there is nothing there or it is a group.
    fn dataset(&self, path: &str) -> Option<Dataset>;

    /// Names of the children of the group at `path`, in file order.
    fn keys(&self, path: &str) -> Option<Vec<String>>;
}

pub trait ContainerOpener: Send + Sync {
    /// Open `path` read-only and position on the run entry.
    ///
    /// Files still being written when the notification arrives fail here, with
    /// a retryable [`IngestError::FileOpen`].
    fn open(&self, path: &Path) -> Result<Box<dyn Container>, IngestError>;
}

/// Reads containers exported as JSON: objects are groups, arrays and scalars
/// are datasets.
#[derive(Debug, Default, Clone)]
pub struct JsonTreeOpener;

impl ContainerOpener for JsonTreeOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>, IngestError> {
        let file_open = |reason: String| IngestError::FileOpen {
            path: path.to_owned(),
            reason,
        };

        let contents = std::fs::read(path).map_err(|e| file_open(e.to_string()))?;
        let root: Value = serde_json::from_slice(&contents)
            .map_err(|e| file_open(format!("unrecognised container: {e}")))?;
        let Value::Object(root) = root else {
            return Err(file_open("container root is not a group".to_owned()));
        };

        let entry = root
            .into_iter()
            .find_map(|(_, value)| match value {
                Value::Object(group) => Some(group),
                _ => None,
            })
            .ok_or_else(|| file_open("container has no entry group".to_owned()))?;

        Ok(Box::new(JsonTree { entry }))
    }
}

struct JsonTree {
    entry: Map<String, Value>,
}

impl JsonTree {
    fn node(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('/').filter(|segment| !segment.is_empty());
        let first = segments.next()?;
        segments.try_fold(self.entry.get(first)?, |node, segment| {
            node.as_object()?.get(segment)
        })
    }
}

impl Container for JsonTree {
    fn dataset(&self, path: &str) -> Option<Dataset> {
        match self.node(path)? {
            Value::Object(_) | Value::Null => None,
            Value::Array(values) => to_dataset(values),
            scalar => to_dataset(std::slice::from_ref(scalar)),
        }
    }

    fn keys(&self, path: &str) -> Option<Vec<String>> {
        let group = match path.trim_matches('/') {
            "" => &self.entry,
            path => self.node(path)?.as_object()?,
        };
        Some(group.keys().cloned().collect())
    }
}

fn to_dataset(values: &[Value]) -> Option<Dataset> {
    if values.iter().all(Value::is_string) {
        return Some(Dataset::Text(
            values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_owned))
                .collect(),
        ));
    }
    if values.iter().all(|value| value.is_i64() || value.is_boolean()) {
        return Some(Dataset::Int(
            values
                .iter()
                .filter_map(|value| value.as_i64().or(value.as_bool().map(i64::from)))
                .collect(),
        ));
    }
    if values.iter().all(Value::is_number) {
        return Some(Dataset::Float(
            values.iter().filter_map(Value::as_f64).collect(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_container(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_entry_is_first_top_level_group() {
        let file = write_container(
            &json!({
                "format": "NXroot",
                "raw_data_1": {
                    "run_number": [110782],
                    "title": "Test Run",
                    "user_1": {"name": ["J. Smith"]},
                    "selog": {"freq10": {"value_log": {"value": [25.0, 25.1]}}}
                },
                "raw_data_2": {"run_number": [1]}
            })
            .to_string(),
        );

        let container = JsonTreeOpener.open(file.path()).unwrap();

        assert_eq!(
            container.dataset("run_number"),
            Some(Dataset::Int(vec![110782]))
        );
        assert_eq!(
            container.dataset("title"),
            Some(Dataset::Text(vec!["Test Run".to_owned()]))
        );
        assert_eq!(
            container.dataset("user_1/name").and_then(|d| d.first_text()),
            Some("J. Smith".to_owned())
        );
        assert_eq!(
            container.dataset("selog/freq10/value_log/value"),
            Some(Dataset::Float(vec![25.0, 25.1]))
        );
        assert_eq!(container.dataset("user_1"), None);
        assert_eq!(container.dataset("missing/field"), None);
        assert_eq!(
            container.keys(""),
            Some(vec![
                "run_number".to_owned(),
                "title".to_owned(),
                "user_1".to_owned(),
                "selog".to_owned()
            ])
        );
    }

    #[test]
    fn test_half_written_file_is_a_retryable_open_error() {
        let file = write_container(r#"{"raw_data_1": {"run_number": [1107"#);

        let error = JsonTreeOpener.open(file.path()).err().unwrap();

        assert!(matches!(error, IngestError::FileOpen { .. }));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_missing_file_and_missing_entry_fail_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let missing = JsonTreeOpener.open(&dir.path().join("LOQ00110782.nxs"));
        assert!(matches!(missing, Err(IngestError::FileOpen { .. })));

        let file = write_container(r#"{"format": "NXroot"}"#);
        let no_entry = JsonTreeOpener.open(file.path());
        assert!(matches!(no_entry, Err(IngestError::FileOpen { .. })));
    }

    #[test]
    fn test_dataset_conversions() {
        let ints = Dataset::Int(vec![3, 0]);
        assert_eq!(ints.first_float(), Some(3.0));
        assert_eq!(ints.first_bool(), Some(true));
        assert_eq!(ints.first_text(), Some("3".to_owned()));

        let floats = Dataset::Float(vec![2.5]);
        assert_eq!(floats.first_int(), None);
        assert_eq!(Dataset::Float(vec![8067.0]).first_int(), Some(8067));

        let text = Dataset::Text(vec!["42".to_owned(), "n/a".to_owned()]);
        assert_eq!(text.first_int(), Some(42));
        assert_eq!(text.floats(), vec![42.0]);
        assert!(Dataset::Text(vec![]).is_empty());
    }
}
