//! Include expansion: rewrites `include` steps into inlined,
//! parameter-remapped copies of the referenced macro's steps.
//!
//! Expansion runs once per load pass, after every file has parsed and
//! validated; execution never re-expands. The DFS keeps a per-path (not
//! global) visited set, so diamond inclusion is legal while path cycles
//! are not.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::engine::substitute::substitute;
use crate::macros::model::{MacroDefinition, Step};
use crate::types::LoadError;

/// Expand every macro in the table that contains `include` steps. Macros
/// whose expansion fails (unknown target, cycle) are removed from the
/// table and reported as load errors.
pub fn expand_all(macros: &mut HashMap<String, MacroDefinition>) -> Vec<LoadError> {
    let mut errors = Vec::new();
    let mut expanded: HashMap<String, Vec<Step>> = HashMap::new();

    let mut names: Vec<String> = macros
        .iter()
        .filter(|(_, def)| def.has_includes())
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();

    for name in &names {
        let def = &macros[name];
        let mut path = vec![name.clone()];
        match expand_steps(&def.steps, macros, &mut path) {
            Ok(steps) => {
                debug!(
                    macro_name = %name,
                    steps_before = def.steps.len(),
                    steps_after = steps.len(),
                    "Expanded includes"
                );
                expanded.insert(name.clone(), steps);
            }
            Err(message) => {
                warn!(macro_name = %name, error = %message, "Include expansion failed");
                errors.push(LoadError {
                    path: def.source_path.clone(),
                    macro_name: name.clone(),
                    message,
                });
            }
        }
    }

    for (name, steps) in expanded {
        if let Some(def) = macros.get_mut(&name) {
            def.steps = steps;
        }
    }
    for err in &errors {
        macros.remove(&err.macro_name);
    }

    errors
}

/// DFS over one macro's steps. `path` holds the canonical names currently
/// being expanded, outermost first.
fn expand_steps(
    steps: &[Step],
    macros: &HashMap<String, MacroDefinition>,
    path: &mut Vec<String>,
) -> Result<Vec<Step>, String> {
    let mut out = Vec::with_capacity(steps.len());

    for step in steps {
        let Step::Include {
            macro_name, params, ..
        } = step
        else {
            out.push(step.clone());
            continue;
        };

        let key = macro_name.trim().to_ascii_lowercase();
        if path.iter().any(|seen| *seen == key) {
            return Err(format!(
                "circular include: {} -> {}",
                path.join(" -> "),
                key
            ));
        }
        let target = macros
            .get(&key)
            .ok_or_else(|| format!("include references unknown macro '{}'", macro_name))?;

        path.push(key);
        let inner = expand_steps(&target.steps, macros, path)?;
        path.pop();

        // Splice in clones of the target's steps, remapping the child's
        // `{{param}}` tokens to the values (literal or placeholder) given
        // in this include's params map.
        for mut inlined in inner {
            inlined.map_strings(|text| substitute(text, params));
            out.push(inlined);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::model::StepMeta;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn type_step(text: &str) -> Step {
        Step::TypeText {
            text: text.to_string(),
            meta: StepMeta::default(),
        }
    }

    fn include_step(target: &str, params: &[(&str, &str)]) -> Step {
        Step::Include {
            macro_name: target.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            meta: StepMeta::default(),
        }
    }

    fn def(name: &str, steps: Vec<Step>) -> MacroDefinition {
        MacroDefinition {
            name: name.to_string(),
            source_path: PathBuf::from(format!("{name}.json")),
            display_name: name.to_string(),
            description: String::new(),
            timeout: 0,
            parameters: Vec::new(),
            steps,
        }
    }

    fn table(defs: Vec<MacroDefinition>) -> HashMap<String, MacroDefinition> {
        defs.into_iter().map(|d| (d.name.clone(), d)).collect()
    }

    #[test]
    fn test_no_includes_is_a_noop() {
        let mut macros = table(vec![def("plain", vec![type_step("hello {{x}}")])]);
        let before = macros["plain"].steps.clone();
        let errors = expand_all(&mut macros);
        assert!(errors.is_empty());
        assert_eq!(macros["plain"].steps, before);
    }

    #[test]
    fn test_simple_include_splices_and_remaps() {
        let child = def("child", vec![type_step("value={{inner}}")]);
        let parent = def(
            "parent",
            vec![
                type_step("before"),
                include_step("child", &[("inner", "42")]),
                type_step("after"),
            ],
        );
        let mut macros = table(vec![child, parent]);
        let errors = expand_all(&mut macros);
        assert!(errors.is_empty());

        let steps = &macros["parent"].steps;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1], type_step("value=42"));
        // child itself untouched
        assert_eq!(macros["child"].steps, vec![type_step("value={{inner}}")]);
    }

    #[test]
    fn test_remap_to_parent_placeholder() {
        let child = def("child", vec![type_step("{{inner}}")]);
        let parent = def(
            "parent",
            vec![include_step("child", &[("inner", "{{outer}}")])],
        );
        let mut macros = table(vec![child, parent]);
        assert!(expand_all(&mut macros).is_empty());
        // the parent's own parameter substitution happens at run time
        assert_eq!(macros["parent"].steps, vec![type_step("{{outer}}")]);
    }

    #[test]
    fn test_nested_include_expands_transitively() {
        let leaf = def("leaf", vec![type_step("leaf")]);
        let mid = def("mid", vec![include_step("leaf", &[]), type_step("mid")]);
        let top = def("top", vec![include_step("mid", &[])]);
        let mut macros = table(vec![leaf, mid, top]);
        assert!(expand_all(&mut macros).is_empty());
        assert_eq!(
            macros["top"].steps,
            vec![type_step("leaf"), type_step("mid")]
        );
    }

    #[test]
    fn test_diamond_inclusion_is_legal() {
        let base = def("base", vec![type_step("base")]);
        let left = def("left", vec![include_step("base", &[])]);
        let right = def("right", vec![include_step("base", &[])]);
        let top = def(
            "top",
            vec![include_step("left", &[]), include_step("right", &[])],
        );
        let mut macros = table(vec![base, left, right, top]);
        let errors = expand_all(&mut macros);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            macros["top"].steps,
            vec![type_step("base"), type_step("base")]
        );
    }

    #[test]
    fn test_cycle_fails_both_macros() {
        let a = def("a", vec![include_step("b", &[])]);
        let b = def("b", vec![include_step("a", &[])]);
        let mut macros = table(vec![a, b]);
        let errors = expand_all(&mut macros);

        assert_eq!(errors.len(), 2);
        for err in &errors {
            assert!(err.message.contains("circular include"), "{}", err.message);
        }
        assert!(errors.iter().any(|e| e.message.contains("a -> b")));
        assert!(!macros.contains_key("a"));
        assert!(!macros.contains_key("b"));
    }

    #[test]
    fn test_self_include_is_a_cycle() {
        let a = def("a", vec![include_step("a", &[])]);
        let mut macros = table(vec![a]);
        let errors = expand_all(&mut macros);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("circular include"));
        assert!(macros.is_empty());
    }

    #[test]
    fn test_unknown_target_reported() {
        let a = def("a", vec![include_step("ghost", &[])]);
        let mut macros = table(vec![a]);
        let errors = expand_all(&mut macros);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unknown macro 'ghost'"));
        assert!(!macros.contains_key("a"));
    }

    #[test]
    fn test_include_target_name_case_insensitive() {
        let child = def("shared/login", vec![type_step("login")]);
        let parent = def("parent", vec![include_step("Shared/Login", &[])]);
        let mut macros = table(vec![child, parent]);
        assert!(expand_all(&mut macros).is_empty());
        assert_eq!(macros["parent"].steps, vec![type_step("login")]);
    }
}
