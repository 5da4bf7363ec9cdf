//! Environment variable merge law used when building the environment block
//! passed to a subprocess (spec.md §3, "environment").
//!
//! Key comparison is case-insensitive; the last write wins; the casing kept
//! in the output is whichever casing was *first seen* for that key; entries
//! are returned sorted case-insensitively by key, matching the order the
//! Windows environment block requires and that Linux gains for free.

/// Merge a sequence of `(name, value)` pairs under the rules above.
///
/// Later entries in `entries` override earlier ones by value, but the
/// casing of the *first* occurrence of a key is preserved in the result.
pub fn merge<I, K, V>(entries: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    // Preserve first-seen casing by keying on the lowercased name while
    // remembering the original-cased name alongside the latest value.
    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();

    for (name, value) in entries {
        let name = name.as_ref();
        let value = value.as_ref();
        let key = name.to_lowercase();

        match merged.get_mut(&key) {
            Some(existing) => {
                existing.1 = value.to_owned();
            }
            None => {
                order.push(key.clone());
                merged.insert(key, (name.to_owned(), value.to_owned()));
            }
        }
    }

    let mut result: Vec<(String, String)> = order
        .into_iter()
        .map(|key| merged.remove(&key).unwrap())
        .collect();
    result.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    result
}

/// Render a merged environment as `KEY=VALUE` strings, in the same order
/// `merge` returned them, suitable for building a native environment block.
pub fn to_key_value_strings(merged: &[(String, String)]) -> Vec<String> {
    merged
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_law_last_write_wins_first_casing_kept_sorted() {
        let merged = merge(vec![("a", "1"), ("B", "2")].into_iter().chain(vec![
            ("A", "3"),
            ("c", "4"),
        ]));

        assert_eq!(
            merged,
            vec![
                ("a".to_owned(), "3".to_owned()),
                ("B".to_owned(), "2".to_owned()),
                ("c".to_owned(), "4".to_owned()),
            ]
        );
    }

    #[test]
    fn merge_is_case_insensitive_on_key_identity() {
        let merged = merge(vec![("PATH", "/usr/bin"), ("path", "/bin")]);
        assert_eq!(merged, vec![("PATH".to_owned(), "/bin".to_owned())]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let merged: Vec<(String, String)> = merge(Vec::<(String, String)>::new());
        assert!(merged.is_empty());
    }

    #[test]
    fn renders_key_value_strings_in_merge_order() {
        let merged = merge(vec![("b", "2"), ("a", "1")]);
        assert_eq!(
            to_key_value_strings(&merged),
            vec!["a=1".to_owned(), "b=2".to_owned()]
        );
    }
}
