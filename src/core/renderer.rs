use serde_json::Value;

use super::error::{CoreError, Result};

/// Template evaluation for trigger inputs and dynamic task expansion.
///
/// Treated as a pure function: two calls with the same template and variables
/// must produce the same value. The engine only depends on this trait; richer
/// expression languages plug in behind it.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, vars: &Value) -> Result<Value>;
}

/// Minimal renderer: a template that is exactly one `{{ path.to.var }}`
/// placeholder resolves to the referenced value; a template containing
/// placeholders inside a larger string substitutes their string forms; any
/// other template parses as a JSON literal, falling back to the raw string.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl JsonRenderer {
    fn lookup<'a>(vars: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = vars;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn placeholder(template: &str) -> Option<&str> {
        let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
        Some(inner.trim())
    }
}

impl Renderer for JsonRenderer {
    fn render(&self, template: &str, vars: &Value) -> Result<Value> {
        let trimmed = template.trim();

        // whole-template placeholder keeps the referenced value's type
        if let Some(path) = Self::placeholder(trimmed) {
            return Self::lookup(vars, path).cloned().ok_or_else(|| {
                CoreError::Render {
                    template: template.to_string(),
                    reason: format!("unknown variable '{}'", path),
                }
            });
        }

        if trimmed.contains("{{") {
            let mut rendered = String::new();
            let mut rest = trimmed;

            while let Some(start) = rest.find("{{") {
                let Some(end) = rest[start..].find("}}") else {
                    return Err(CoreError::Render {
                        template: template.to_string(),
                        reason: "unbalanced '{{'".to_string(),
                    });
                };

                rendered.push_str(&rest[..start]);
                let path = rest[start + 2..start + end].trim();
                let value = Self::lookup(vars, path).ok_or_else(|| CoreError::Render {
                    template: template.to_string(),
                    reason: format!("unknown variable '{}'", path),
                })?;

                match value {
                    Value::String(s) => rendered.push_str(s),
                    other => rendered.push_str(&other.to_string()),
                }

                rest = &rest[start + end + 2..];
            }
            rendered.push_str(rest);

            return Ok(Value::String(rendered));
        }

        match serde_json::from_str(trimmed) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(trimmed.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let vars = json!({"trigger": {"values": [1, 2, 3]}});
        let rendered = JsonRenderer
            .render("{{ trigger.values }}", &vars)
            .unwrap();
        assert_eq!(rendered, json!([1, 2, 3]));
    }

    #[test]
    fn test_inline_substitution() {
        let vars = json!({"outputs": {"uri": "s3://bucket/report"}});
        let rendered = JsonRenderer
            .render("from {{ outputs.uri }}", &vars)
            .unwrap();
        assert_eq!(rendered, json!("from s3://bucket/report"));
    }

    #[test]
    fn test_json_literal_and_fallback() {
        let vars = json!({});
        assert_eq!(
            JsonRenderer.render(r#"["a", "b"]"#, &vars).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(JsonRenderer.render("plain", &vars).unwrap(), json!("plain"));
    }

    #[test]
    fn test_unknown_variable_fails() {
        assert!(JsonRenderer.render("{{ missing }}", &json!({})).is_err());
    }
}
