use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Types that can be requested as strict OpenAI structured output.
///
/// Implemented for anything that is `JsonSchema + DeserializeOwned`. Strict
/// mode requires every object to set `additionalProperties: false`, list all
/// of its properties as required (nullable ones included), and contain no
/// `$ref`s.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn openai_schema() -> Value {
        let mut root = serde_json::to_value(schema_for!(Self)).unwrap_or_default();

        let definitions = match &mut root {
            Value::Object(map) => {
                map.remove("$schema");
                map.remove("definitions")
            }
            _ => None,
        }
        .unwrap_or(Value::Object(Map::new()));

        strictify(&mut root, &definitions);
        root
    }

    fn type_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Inline `$ref`s and single-element `allOf` wrappers, then close every object.
fn strictify(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(target) = map.get("$ref").and_then(Value::as_str).map(str::to_owned) {
                let name = target.trim_start_matches("#/definitions/");
                if let Some(def) = definitions.get(name) {
                    *value = def.clone();
                    strictify(value, definitions);
                    return;
                }
            }

            if let Some(Value::Array(all_of)) = map.get("allOf").cloned() {
                if let [only] = all_of.as_slice() {
                    *value = only.clone();
                    strictify(value, definitions);
                    return;
                }
            }

            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".into(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let required = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".into(), Value::Array(required));
                }
            }

            for child in map.values_mut() {
                strictify(child, definitions);
            }
        }
        Value::Array(items) => {
            for item in items {
                strictify(item, definitions);
            }
        }
        _ => {}
    }
}
