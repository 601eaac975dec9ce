use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::{Captures, Regex};
use serde_json::Value;

use crate::model::package::PackageConfig;

pub type Variables = BTreeMap<String, String>;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}|\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("valid template token regex")
});

/// Replaces `${name}` and `{{name}}` tokens. Unknown names are left as written.
pub fn substitute(text: &str, vars: &Variables) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            vars.get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Substitutes every string leaf of a JSON value.
pub fn substitute_value(value: &Value, vars: &Variables) -> Value {
    match value {
        Value::String(text) => Value::String(substitute(text, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute_value(item, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute_value(item, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves a package's variables for one install.
///
/// Each declared variable takes the project's configured value, then its
/// environment variable, then its default. Configured keys the package does
/// not declare pass through unchanged; `builtins` always win.
pub fn resolve_variables(
    package: &PackageConfig,
    configured: &Variables,
    builtins: Variables,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Variables> {
    let mut resolved: Variables = configured.clone();
    let mut missing = Vec::new();

    for (name, decl) in &package.variables {
        let value = configured
            .get(name)
            .cloned()
            .or_else(|| decl.env.as_deref().and_then(&env))
            .or_else(|| decl.default.clone());

        match value {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None if decl.required => missing.push(name.as_str()),
            None => {}
        }
    }

    if !missing.is_empty() {
        bail!(
            "missing required variable(s): {} (set them under [plugins.{}.config])",
            missing.join(", "),
            package.name()
        );
    }

    resolved.extend(builtins);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_both_token_styles() {
        let vars = vars(&[("name", "dex"), ("url", "https://x.test")]);
        assert_eq!(
            substitute("hi ${name} at {{ url }} / {{name}}", &vars),
            "hi dex at https://x.test / dex"
        );
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let vars = vars(&[("name", "dex")]);
        assert_eq!(
            substitute("${missing} {{other}} ${input:token} $name", &vars),
            "${missing} {{other}} ${input:token} $name"
        );
    }

    #[test]
    fn substitutes_json_string_leaves() {
        let vars = vars(&[("token", "abc")]);
        let value = json!({"args": ["--token", "${token}"], "port": 8080});
        assert_eq!(
            substitute_value(&value, &vars),
            json!({"args": ["--token", "abc"], "port": 8080})
        );
    }

    #[test]
    fn resolution_order_and_required_check() {
        let raw = r#"
[package]
name = "p"
version = "1.0.0"

[variables.a]
default = "from-default"
env = "P_A"

[variables.b]
env = "P_B"
default = "unused"

[variables.c]
default = "from-default"

[variables.d]
required = true
"#;
        let package = PackageConfig::parse(raw, Path::new("/pkg")).unwrap();
        let env = |name: &str| (name == "P_B").then(|| "from-env".to_string());

        let configured = vars(&[("a", "from-config"), ("d", "set"), ("extra", "x")]);
        let builtins = vars(&[("plugin_name", "p")]);
        let resolved = resolve_variables(&package, &configured, builtins, env).unwrap();

        assert_eq!(resolved["a"], "from-config");
        assert_eq!(resolved["b"], "from-env");
        assert_eq!(resolved["c"], "from-default");
        assert_eq!(resolved["extra"], "x");
        assert_eq!(resolved["plugin_name"], "p");

        let err = resolve_variables(&package, &Variables::new(), Variables::new(), env).unwrap_err();
        assert!(err.to_string().contains("missing required variable(s): d"));
    }
}
