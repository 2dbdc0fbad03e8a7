use plist::{Dictionary, Value};

/// Renders a plist for logs and CLI output. Data blobs are summarized by
/// length instead of dumped.
pub fn pretty_print_plist(value: &Value) -> String {
    print_value(value, 0)
}

/// Renders a dictionary the same way [`pretty_print_plist`] does.
pub fn pretty_print_dictionary(dict: &Dictionary) -> String {
    print_dictionary(dict, 0)
}

fn print_value(value: &Value, indent: usize) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i
            .as_signed()
            .map(|v| v.to_string())
            .or_else(|| i.as_unsigned().map(|v| v.to_string()))
            .unwrap_or_else(|| format!("{i:?}")),
        Value::Real(r) => r.to_string(),
        Value::Date(d) => format!("{d:?}"),
        Value::Data(d) => format!("<{} bytes>", d.len()),
        Value::Uid(u) => format!("{u:?}"),
        Value::Array(items) => {
            if items.is_empty() {
                return "[]".into();
            }
            let pad = "  ".repeat(indent + 1);
            let body = items
                .iter()
                .map(|item| format!("{pad}{}", print_value(item, indent + 1)))
                .collect::<Vec<_>>()
                .join(",\n");
            format!("[\n{body}\n{}]", "  ".repeat(indent))
        }
        Value::Dictionary(dict) => print_dictionary(dict, indent),
        _ => "<unknown>".into(),
    }
}

fn print_dictionary(dict: &Dictionary, indent: usize) -> String {
    if dict.is_empty() {
        return "{}".into();
    }
    let pad = "  ".repeat(indent + 1);
    let body = dict
        .iter()
        .map(|(key, value)| format!("{pad}{key}: {}", print_value(value, indent + 1)))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("{{\n{body}\n{}}}", "  ".repeat(indent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_summarized_not_dumped() {
        let mut dict = Dictionary::new();
        dict.insert("Key".into(), Value::Data(vec![0u8; 1024]));
        dict.insert("Name".into(), Value::String("device".into()));

        let rendered = pretty_print_dictionary(&dict);
        assert!(rendered.contains("<1024 bytes>"));
        assert!(rendered.contains("\"device\""));
    }
}
