//! Process-wide stage factory registry
//!
//! Maps a stage class name to a factory that deserializes its configuration
//! document. The registry is lazily initialized on first use (there are no
//! static constructors to order), and each key may be registered exactly
//! once. The built-in `"pipeline"` container class is installed when the
//! registry is first touched.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;

use crate::container::pipeline_from_json;
use crate::error::{Error, Result};
use crate::pipeline_object::PipelineObject;

/// Factory signature: builds an unbound stage from its configuration
/// document.
pub type JsonFactory = fn(&Value) -> Result<PipelineObject>;

static REGISTRY: OnceLock<Mutex<HashMap<String, JsonFactory>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, JsonFactory>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, JsonFactory> = HashMap::new();
        map.insert("pipeline".to_string(), pipeline_from_json);
        Mutex::new(map)
    })
}

/// Register a factory under a class name. Duplicate registrations fail.
pub fn register_json_factory(class_name: &str, f: JsonFactory) -> Result<()> {
    if class_name.is_empty() {
        return Err(Error::Stage(
            "register_json_factory(): class_name must be a nonempty string".into(),
        ));
    }

    let mut map = registry().lock().unwrap();
    if map.contains_key(class_name) {
        return Err(Error::Stage(format!(
            "register_json_factory(): duplicate registration for class_name='{}'",
            class_name
        )));
    }

    map.insert(class_name.to_string(), f);
    Ok(())
}

/// Deserialize a stage from its configuration document, dispatching on the
/// required `class_name` field.
pub fn from_json(x: &Value) -> Result<PipelineObject> {
    let obj = x
        .as_object()
        .ok_or_else(|| Error::Stage("from_json(): expected json argument to be an object".into()))?;

    let class_name = obj
        .get("class_name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Stage("from_json(): expected string field 'class_name'".into()))?;

    let f = registry().lock().unwrap().get(class_name).copied();
    let f = f.ok_or_else(|| {
        Error::Stage(format!(
            "from_json(): class_name='{}' not found, maybe a register_json_factory() call is missing",
            class_name
        ))
    })?;

    f(x)
}

/// Sorted list of registered class names; diagnostic.
pub fn registered_class_names() -> Vec<String> {
    let map = registry().lock().unwrap();
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_factory(_: &Value) -> Result<PipelineObject> {
        Err(Error::Stage("dummy factory".into()))
    }

    #[test]
    fn test_duplicate_registration_fails() {
        register_json_factory("registry_test_dup", dummy_factory).unwrap();
        assert!(register_json_factory("registry_test_dup", dummy_factory).is_err());
    }

    #[test]
    fn test_empty_class_name_rejected() {
        assert!(register_json_factory("", dummy_factory).is_err());
    }

    #[test]
    fn test_unknown_class_name() {
        let doc = serde_json::json!({ "class_name": "no_such_stage_class" });
        assert!(from_json(&doc).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(from_json(&Value::from(3)).is_err());
        assert!(from_json(&serde_json::json!({ "nt_chunk": 512 })).is_err());
    }

    #[test]
    fn test_builtin_pipeline_registered() {
        assert!(registered_class_names().contains(&"pipeline".to_string()));
    }
}
