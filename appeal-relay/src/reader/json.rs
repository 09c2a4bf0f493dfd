use std::path::Path;

use serde_json::{Map, Value};

use super::{BatchBuilder, TableReader, TabularBatch};
use crate::error::FileError;

/// A JSON array of objects, or newline-delimited objects when the file is not an array.
pub struct JsonReader;

impl TableReader for JsonReader {
    fn read(&self, path: &Path) -> Result<TabularBatch, FileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| FileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let objects = match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(map) => Ok(map),
                    other => Err(FileError::read(
                        path,
                        format!("array element {i} is {}, expected an object", kind(&other)),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => parse_lines(path, &contents)?,
        };

        let mut builder = BatchBuilder::new();
        for object in &objects {
            builder.push_row(object.iter().map(|(k, v)| (k.as_str(), value_to_cell(v))));
        }
        Ok(builder.finish())
    }
}

fn parse_lines(path: &Path, contents: &str) -> Result<Vec<Map<String, Value>>, FileError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Map<String, Value>>(line)
                .map_err(|e| FileError::read(path, format!("line {}: {e}", i + 1)))
        })
        .collect()
}

fn value_to_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
