//! Placeholder substitution for request templates
//!
//! Templates are arbitrary JSON values containing `{{name}}` placeholders.
//! A string that consists of exactly one placeholder is replaced by the
//! context value itself, so objects, arrays, numbers and booleans survive
//! substitution with their JSON types intact. Placeholders embedded inside
//! longer strings are stringified in place.

use crate::conversation;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Renders `{{name}}` placeholders against a context map
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap(),
        }
    }

    /// Render a template against the context
    ///
    /// The context is mutable because conversation-tracking placeholders with
    /// no context value are backfilled with a generated id, so later renders
    /// in the same invocation see the same value.
    pub fn render(&self, template: &Value, context: &mut Map<String, Value>) -> Value {
        match template {
            Value::String(text) => self.render_string(text, context),
            Value::Object(fields) => {
                let mut rendered = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    rendered.insert(key.clone(), self.render(value, context));
                }
                Value::Object(rendered)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render(item, context))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Render a string template, preserving the JSON type of whole-string
    /// placeholders
    fn render_string(&self, text: &str, context: &mut Map<String, Value>) -> Value {
        if let Some(name) = self.sole_placeholder(text) {
            return self.lookup(&name, context);
        }

        let mut output = String::with_capacity(text.len());
        let mut last_end = 0;
        for captures in self.placeholder.captures_iter(text) {
            let matched = captures.get(0).unwrap();
            let name = &captures[1];
            output.push_str(&text[last_end..matched.start()]);
            output.push_str(&stringify(&self.lookup(name, context)));
            last_end = matched.end();
        }
        output.push_str(&text[last_end..]);
        Value::String(output)
    }

    /// Render a string template to its string form
    ///
    /// Header values and query parameters go through this: a whole-string
    /// placeholder bound to a non-string value is stringified.
    pub fn render_text(&self, template: &str, context: &mut Map<String, Value>) -> String {
        match self.render_string(template, context) {
            Value::String(text) => text,
            other => stringify(&other),
        }
    }

    /// The placeholder name when the string is exactly one placeholder
    fn sole_placeholder(&self, text: &str) -> Option<String> {
        let captures = self.placeholder.captures(text)?;
        let matched = captures.get(0)?;
        if matched.start() == 0 && matched.end() == text.len() {
            Some(captures[1].to_string())
        } else {
            None
        }
    }

    /// Resolve a placeholder name against the context
    ///
    /// Unknown names render as an empty string, except conversation-tracking
    /// candidates, which are minted on first use and written back into the
    /// context so the generated id is stable across the invocation.
    fn lookup(&self, name: &str, context: &mut Map<String, Value>) -> Value {
        if let Some(value) = context.get(name) {
            if !value.is_null() {
                return value.clone();
            }
        }
        if conversation::is_tracking_candidate(name) {
            let generated = Value::String(Uuid::new_v4().to_string());
            context.insert(name.to_string(), generated.clone());
            return generated;
        }
        Value::String(String::new())
    }
}

/// Stringify a value for embedding inside a longer string
fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
