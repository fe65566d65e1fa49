//! Migrations for the parsed settings file.
//!
//! The settings file is hand edited, so steps here only ever fill gaps and normalize shapes.
//! Values a user wrote are kept.

use serde_json::{json, Map, Value};

use super::{Layer, PayloadMigration, VersionCoordinator};
use crate::error::Error;

fn object(payload: &mut Value) -> Result<&mut Map<String, Value>, Error> {
    payload
        .as_object_mut()
        .ok_or_else(|| Error::Serialization("settings must be a table".to_string()))
}

fn section<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    map.entry(key.to_string())
        .or_insert_with(|| json!({}))
        .as_object_mut()
}

struct Defaults;

impl PayloadMigration for Defaults {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> String {
        "defaults".to_string()
    }

    fn up(&self, mut payload: Value) -> Result<Value, Error> {
        let map = object(&mut payload)?;
        if let Some(paths) = section(map, "paths") {
            paths.entry("sql").or_insert_with(|| json!("sql"));
            paths.entry("changes").or_insert_with(|| json!("changes"));
        }
        if let Some(build) = section(map, "build") {
            build.entry("include").or_insert_with(|| json!([]));
            build.entry("exclude").or_insert_with(|| json!([]));
        }
        map.entry("stages").or_insert_with(|| json!({}));
        if let Some(logging) = section(map, "logging") {
            logging.entry("enabled").or_insert(Value::Bool(true));
            logging.entry("level").or_insert_with(|| json!("info"));
        }
        Ok(payload)
    }
}

/// Single-string path lists become arrays and the log level is lowercased.
struct NormalizeLists;

impl PayloadMigration for NormalizeLists {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> String {
        "normalize lists".to_string()
    }

    fn up(&self, mut payload: Value) -> Result<Value, Error> {
        let map = object(&mut payload)?;
        if let Some(build) = map.get_mut("build").and_then(Value::as_object_mut) {
            for key in ["include", "exclude"] {
                if let Some(Value::String(single)) = build.get(key) {
                    let list = json!([single]);
                    build.insert(key.to_string(), list);
                }
            }
        }
        if let Some(level) = map
            .get_mut("logging")
            .and_then(|l| l.get_mut("level"))
        {
            if let Value::String(s) = level {
                *s = s.to_ascii_lowercase();
            }
        }
        Ok(payload)
    }
}

pub fn migrations() -> Vec<Box<dyn PayloadMigration>> {
    vec![Box::new(Defaults), Box::new(NormalizeLists)]
}

pub fn coordinator() -> Result<VersionCoordinator, Error> {
    VersionCoordinator::try_new(Layer::Settings, migrations()).map_err(Error::Generic)
}
