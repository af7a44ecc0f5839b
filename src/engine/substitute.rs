//! `{{name}}` parameter substitution and the per-invocation alias table.
//!
//! Substitution is a single linear scan. Replacement values are never
//! rescanned, so nested or recursive templating cannot occur, and tokens
//! with no matching parameter are left byte-for-byte in place.

use std::collections::{BTreeMap, HashMap};

use crate::backend::ElementRef;

/// Replace every `{{name}}` token whose name resolves through `lookup`.
/// Unknown tokens stay verbatim.
pub fn substitute_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find("}}") {
                let token = &input[i + 2..i + 2 + end];
                match lookup(token.trim()) {
                    Some(value) => {
                        out.push_str(&value);
                        i += 2 + end + 2;
                        continue;
                    }
                    None => {
                        // keep the whole token untouched
                        out.push_str(&input[i..i + 2 + end + 2]);
                        i += 2 + end + 2;
                        continue;
                    }
                }
            }
        }
        let ch = input[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Substitute from a parameter map with case-insensitive names.
pub fn substitute(input: &str, params: &BTreeMap<String, String>) -> String {
    substitute_with(input, |token| {
        params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, value)| value.clone())
    })
}

/// Case-insensitive `save_as` name → element-reference key map, scoped to
/// one macro invocation. A nested macro call gets a fresh table.
#[derive(Debug, Default)]
pub struct AliasTable {
    inner: HashMap<String, ElementRef>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, handle: ElementRef) {
        self.inner.insert(name.to_ascii_lowercase(), handle);
    }

    pub fn get(&self, name: &str) -> Option<&ElementRef> {
        self.inner.get(&name.to_ascii_lowercase())
    }

    /// Resolve a `ref` argument: alias table first, else the literal key.
    pub fn resolve(&self, name: &str) -> ElementRef {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| ElementRef::new(name))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_substitution() {
        let p = params(&[("user", "admin"), ("host", "box1")]);
        assert_eq!(
            substitute("login {{user}} on {{host}}", &p),
            "login admin on box1"
        );
    }

    #[test]
    fn test_unknown_tokens_left_verbatim() {
        let p = params(&[("user", "admin")]);
        assert_eq!(
            substitute("{{user}} vs {{missing}} and {{ also missing }}", &p),
            "admin vs {{missing}} and {{ also missing }}"
        );
    }

    #[test]
    fn test_no_recursion_into_replacements() {
        // A value that itself looks like a token is not rescanned.
        let p = params(&[("a", "{{b}}"), ("b", "never")]);
        assert_eq!(substitute("{{a}}", &p), "{{b}}");
    }

    #[test]
    fn test_parameter_names_case_insensitive() {
        let p = params(&[("Mode", "fast")]);
        assert_eq!(substitute("run {{mode}}", &p), "run fast");
        assert_eq!(substitute("run {{MODE}}", &p), "run fast");
    }

    #[test]
    fn test_unterminated_token_passes_through() {
        let p = params(&[("user", "admin")]);
        assert_eq!(substitute("oops {{user", &p), "oops {{user");
        assert_eq!(substitute("}} {{user}}", &p), "}} admin");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(substitute("", &params(&[])), "");
    }

    #[test]
    fn test_alias_table_case_insensitive_and_scoped() {
        let mut table = AliasTable::new();
        table.set("SaveButton", ElementRef::new("el-7"));
        assert_eq!(table.get("savebutton"), Some(&ElementRef::new("el-7")));
        assert_eq!(table.resolve("SAVEBUTTON"), ElementRef::new("el-7"));
        // unknown names resolve to the literal key
        assert_eq!(table.resolve("el-99"), ElementRef::new("el-99"));
    }
}
