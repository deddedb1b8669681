use serde_json::Value;

/// The pseudo-pointer resolving to the document's key instead of a field.
pub const ID_POINTER: &str = "_id";

/// The distinct pointer strings appearing in filters and pointers, in
/// first-seen order. Each document is resolved once per distinct pointer.
pub fn distinct_pointers(filters: &[String], pointers: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for p in filters.iter().chain(pointers.iter()) {
        if !seen.iter().any(|s: &String| s == p) {
            seen.push(p.clone());
        }
    }
    seen
}

/// Resolves one pointer against a document, applying the extraction rules:
/// `_id` yields the key, scalars (numbers, bools) are stringified, strings
/// pass through, arrays and objects pass through whole, absent paths and
/// JSON nulls yield nothing.
pub fn extract(doc: &Value, key: &str, pointer: &str) -> Option<Value> {
    if pointer == ID_POINTER {
        return Some(Value::String(key.to_string()));
    }
    match doc.pointer(pointer)? {
        Value::Null => None,
        Value::String(s) => Some(Value::String(s.clone())),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        other => Some(other.clone()),
    }
}

/// A filter matches when the extracted value stringifies to exactly the
/// expected string. Arrays and objects never match.
pub fn filter_matches(extracted: Option<&Value>, expected: &str) -> bool {
    match extracted {
        Some(Value::String(s)) => s == expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_fields_and_the_document_key() {
        let doc = json!({
            "kind": "Listing",
            "count": 25,
            "live": true,
            "data": {"children": [{"id": "abc"}]},
            "nothing": null,
        });
        let key = "2013-02-22T16:29:19.750264Z";

        assert_eq!(extract(&doc, key, "/kind"), Some(json!("Listing")));
        assert_eq!(extract(&doc, key, "_id"), Some(json!(key)));
        assert_eq!(extract(&doc, key, "/count"), Some(json!("25")));
        assert_eq!(extract(&doc, key, "/live"), Some(json!("true")));
        assert_eq!(
            extract(&doc, key, "/data/children/0/id"),
            Some(json!("abc"))
        );
        assert_eq!(extract(&doc, key, "/missing"), None);
        assert_eq!(extract(&doc, key, "/nothing"), None);
        // Containers pass through whole.
        assert_eq!(
            extract(&doc, key, "/data"),
            Some(json!({"children": [{"id": "abc"}]}))
        );
    }

    #[test]
    fn filters_match_exact_strings_only() {
        let doc = json!({"kind": "a", "n": 5, "obj": {"x": 1}});
        let kind = extract(&doc, "k", "/kind");
        let n = extract(&doc, "k", "/n");
        let obj = extract(&doc, "k", "/obj");

        assert!(filter_matches(kind.as_ref(), "a"));
        assert!(!filter_matches(kind.as_ref(), "b"));
        assert!(filter_matches(n.as_ref(), "5"));
        assert!(!filter_matches(obj.as_ref(), "{\"x\":1}"));
        assert!(!filter_matches(None, "a"));
    }

    #[test]
    fn distinct_pointers_preserve_first_seen_order() {
        let filters = vec!["/kind".to_string(), "/a".to_string()];
        let pointers = vec!["/v".to_string(), "/kind".to_string()];
        assert_eq!(
            distinct_pointers(&filters, &pointers),
            vec!["/kind", "/a", "/v"]
        );
    }
}
