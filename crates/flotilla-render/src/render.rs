use std::collections::HashMap;

use flotilla_domain::{DeviceSpec, Metadata};
use serde_json::{json, Value};
use tera::{Context, Tera};

use crate::error::RenderError;

/// Expand every templated string field of `template` over the device's
/// whitelisted metadata and return the concrete spec.
///
/// The context exposes exactly `metadata.name` and `metadata.labels`;
/// anything else is an undefined variable and fails the render. Deterministic:
/// the result depends only on the template and the device metadata.
pub fn render_device_spec(
    template: &DeviceSpec,
    metadata: &Metadata,
) -> Result<DeviceSpec, RenderError> {
    let mut tera = renderer();
    let context = build_context(metadata);

    let mut value = serde_json::to_value(template)?;
    render_value(&mut value, &mut tera, &context)?;
    Ok(serde_json::from_value(value)?)
}

fn renderer() -> Tera {
    let mut tera = Tera::default();
    tera.register_function("getOrDefault", get_or_default);
    tera
}

fn build_context(metadata: &Metadata) -> Context {
    let labels: Value = match &metadata.labels {
        Some(labels) => json!(labels),
        None => json!({}),
    };
    let mut context = Context::new();
    context.insert(
        "metadata",
        &json!({
            "name": metadata.name,
            "labels": labels,
        }),
    );
    context
}

fn is_templated(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

fn render_value(value: &mut Value, tera: &mut Tera, context: &Context) -> Result<(), RenderError> {
    match value {
        Value::String(s) if is_templated(s) => {
            *s = render_one(s, tera, context)?;
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                render_value(item, tera, context)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                render_value(item, tera, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn render_one(template: &str, tera: &mut Tera, context: &Context) -> Result<String, RenderError> {
    tera.render_str(template, context)
        .map_err(|e| RenderError::Template {
            template: template.to_string(),
            message: flatten_tera_error(&e),
        })
}

// tera buries the useful message one level down
fn flatten_tera_error(e: &tera::Error) -> String {
    use std::error::Error;
    match e.source() {
        Some(source) => format!("{}: {}", e, source),
        None => e.to_string(),
    }
}

/// `getOrDefault(map=metadata.labels, key="site", default="hq")` — map access
/// that tolerates a missing key, unlike direct label references.
fn get_or_default(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let map = args
        .get("map")
        .and_then(Value::as_object)
        .ok_or_else(|| tera::Error::msg("getOrDefault requires a 'map' argument"))?;
    let key = args
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("getOrDefault requires a string 'key' argument"))?;
    let default = args
        .get("default")
        .cloned()
        .ok_or_else(|| tera::Error::msg("getOrDefault requires a 'default' argument"))?;
    Ok(map.get(key).cloned().unwrap_or(default))
}
