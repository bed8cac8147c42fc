//! Mustache-style `{{var}}` rendering for scripts and email templates.

use outreach_core::types::Lead;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("template variable pattern")
});

/// Variables available to every script: lead fields plus flattened campaign meta.
pub fn lead_vars(lead: &Lead, campaign_meta: Option<&serde_json::Value>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("first_name".into(), lead.first_name.clone());
    vars.insert("last_name".into(), lead.last_name.clone().unwrap_or_default());
    vars.insert("full_name".into(), lead.full_name());
    vars.insert("email".into(), lead.email.clone().unwrap_or_default());
    vars.insert("phone".into(), lead.phone.clone().unwrap_or_default());

    if let Some(serde_json::Value::Object(meta)) = campaign_meta {
        for (key, value) in meta {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            vars.insert(format!("campaign.{key}"), text);
        }
    }
    vars
}

/// Replace every `{{name}}`; unknown names render empty.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    VAR.replace_all(template, |caps: &regex::Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
    .into_owned()
}
