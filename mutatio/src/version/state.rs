//! Migrations for the decrypted state document.

use serde_json::{json, Map, Value};

use super::{Layer, PayloadMigration, VersionCoordinator};
use crate::error::Error;

fn object(payload: &mut Value) -> Result<&mut Map<String, Value>, Error> {
    payload
        .as_object_mut()
        .ok_or_else(|| Error::Serialization("state must be a JSON object".to_string()))
}

/// Introduces the four top-level collections.
struct BaseCollections;

impl PayloadMigration for BaseCollections {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> String {
        "base collections".to_string()
    }

    fn up(&self, mut payload: Value) -> Result<Value, Error> {
        let map = object(&mut payload)?;
        map.entry("configs").or_insert_with(|| json!({}));
        map.entry("secrets").or_insert_with(|| json!({}));
        map.entry("globalSecrets").or_insert_with(|| json!({}));
        map.entry("knownUsers").or_insert_with(|| json!([]));
        Ok(payload)
    }
}

/// Adds the active config pointer and per-config safety flags.
struct ConfigFlags;

impl PayloadMigration for ConfigFlags {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> String {
        "config flags".to_string()
    }

    fn up(&self, mut payload: Value) -> Result<Value, Error> {
        let map = object(&mut payload)?;
        map.entry("activeConfig").or_insert(Value::Null);
        if let Some(configs) = map.get_mut("configs").and_then(Value::as_object_mut) {
            for config in configs.values_mut().filter_map(Value::as_object_mut) {
                config.entry("protected").or_insert(Value::Bool(false));
                config.entry("isTest").or_insert(Value::Bool(false));
            }
        }
        Ok(payload)
    }

    fn down(&self, mut payload: Value) -> Result<Value, Error> {
        let map = object(&mut payload)?;
        map.remove("activeConfig");
        if let Some(configs) = map.get_mut("configs").and_then(Value::as_object_mut) {
            for config in configs.values_mut().filter_map(Value::as_object_mut) {
                config.remove("protected");
                config.remove("isTest");
            }
        }
        Ok(payload)
    }
}

pub fn migrations() -> Vec<Box<dyn PayloadMigration>> {
    vec![Box::new(BaseCollections), Box::new(ConfigFlags)]
}

pub fn coordinator() -> Result<VersionCoordinator, Error> {
    VersionCoordinator::try_new(Layer::State, migrations()).map_err(Error::Generic)
}
