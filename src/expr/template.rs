//! `${...}` message templates and outbound text formatting

use serde_json::Value;

use super::evaluator::{ExprError, Expression};

/// Text form of a JSON value as it goes onto the wire
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Removes one pair of surrounding double quotes
pub fn strip_quotes(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(text)
}

/// Renders a message template against `value`.
///
/// A missing template, an empty one or the literal `value` stand for the
/// value itself. Every `${expr}` is replaced by the evaluated expression.
pub fn render_template(template: Option<&str>, value: &Value) -> Result<String, ExprError> {
    let template = match template {
        Some(t) if !matches!(t.trim(), "" | "value") => t,
        _ => return Ok(value_to_text(value)),
    };

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let end = placeholder_end(body).ok_or(ExprError::UnterminatedPlaceholder)?;
        let expression = Expression::parse(&body[..end])?;
        rendered.push_str(&expression.eval(value)?.to_string());
        rest = &body[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

// Closing brace outside of string literals
fn placeholder_end(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '}' => return Some(idx),
            None => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_or_value_template_passes_value_through() {
        assert_eq!(render_template(None, &json!(5)).unwrap(), "5");
        assert_eq!(render_template(Some(""), &json!("ON")).unwrap(), "ON");
        assert_eq!(render_template(Some("value"), &json!(true)).unwrap(), "true");
    }

    #[test]
    fn placeholders_are_evaluated() {
        assert_eq!(
            render_template(Some("{\"brightness\": ${value * 2}}"), &json!(40)).unwrap(),
            "{\"brightness\": 80}"
        );
        assert_eq!(
            render_template(Some("${value > 0 ? '}' : 'x'}!"), &json!(1)).unwrap(),
            "}!"
        );
    }

    #[test]
    fn broken_templates_are_errors() {
        assert_eq!(
            render_template(Some("${value"), &json!(1)),
            Err(ExprError::UnterminatedPlaceholder)
        );
        assert!(render_template(Some("${foo}"), &json!(1)).is_err());
    }

    #[test]
    fn quotes_are_stripped_once() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("\"\"x\"\""), "\"x\"");
        assert_eq!(strip_quotes("plain"), "plain");
    }
}
