use serde_json::Value;

/// Replace `${VAR}` and `${VAR:-fallback}` placeholders in every string of a
/// config document, leaving keys untouched.
pub fn substitute_env_in_value(value: &mut Value) {
    substitute_value_with(value, &|name| std::env::var(name).ok());
}

fn substitute_value_with(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) if s.contains("${") => *s = substitute_with(s, lookup),
        Value::Array(items) => {
            for item in items {
                substitute_value_with(item, lookup);
            }
        },
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value_with(item, lookup);
            }
        },
        _ => {},
    }
}

/// Unresolvable variables without a fallback are left as written.
fn substitute_with(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let mut inner = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            inner.push(c);
        }
        if !closed || inner.is_empty() {
            result.push_str("${");
            result.push_str(&inner);
            continue;
        }
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (inner.as_str(), None),
        };
        match (lookup(name), fallback) {
            (Some(val), _) => result.push_str(&val),
            (None, Some(fallback)) => result.push_str(fallback),
            (None, None) => {
                result.push_str("${");
                result.push_str(&inner);
                result.push('}');
            },
        }
    }

    result
}
