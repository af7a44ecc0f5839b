//! Pure step-list validation, run before a macro is accepted into the
//! table. Stops at the first violation; every message carries the 1-based
//! step index and the action name.

use crate::macros::model::RawStep;
use crate::types::ValidationError;

/// The fixed action vocabulary (canonical names; `keys` is accepted as an
/// alias for `send_keys` at parse time).
pub const VALID_ACTIONS: &[&str] = &[
    "focus",
    "attach",
    "snapshot",
    "find",
    "find_by_path",
    "click",
    "right_click",
    "type",
    "set_value",
    "get_value",
    "send_keys",
    "wait",
    "wait_for_enabled",
    "macro",
    "include",
    "launch",
    "wait_for_window",
    "screenshot",
    "properties",
    "children",
    "file_dialog",
    "verify",
];

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Validate a raw step list. `Ok(())` means every step carries a known
/// action and its minimal required fields.
pub fn validate_steps(steps: &[RawStep]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::new("macro must have at least one step"));
    }

    for (i, step) in steps.iter().enumerate() {
        let index = i + 1;
        if step.action.trim().is_empty() {
            return Err(ValidationError::new(format!(
                "Step {}: missing 'action'",
                index
            )));
        }

        let action = step.canonical_action();
        if !VALID_ACTIONS.contains(&action.as_str()) {
            return Err(ValidationError::at_step(
                index,
                step.action.trim(),
                format!(
                    "unknown action '{}'. Valid actions: {}",
                    step.action.trim(),
                    VALID_ACTIONS.join(", ")
                ),
            ));
        }

        if let Err(reason) = check_required_fields(&action, step) {
            return Err(ValidationError::at_step(index, &action, reason));
        }
    }

    Ok(())
}

/// Per-action minimal-field rules. Actions not listed here have no
/// mandatory field.
fn check_required_fields(action: &str, step: &RawStep) -> Result<(), String> {
    let any_criteria = present(&step.automation_id)
        || present(&step.name)
        || present(&step.control_type)
        || present(&step.class_name);

    match action {
        "send_keys" => {
            if !present(&step.keys) {
                return Err("requires 'keys'".to_string());
            }
        }
        "find" => {
            if !any_criteria {
                return Err(
                    "requires at least one of 'automation_id', 'name', 'control_type', 'class_name'"
                        .to_string(),
                );
            }
        }
        "find_by_path" => {
            if !present(&step.path) {
                return Err("requires 'path'".to_string());
            }
        }
        "type" => {
            if !present(&step.text) {
                return Err("requires 'text'".to_string());
            }
        }
        "set_value" => {
            if !present(&step.target_ref) {
                return Err("requires 'ref'".to_string());
            }
            if !present(&step.value) {
                return Err("requires 'value'".to_string());
            }
        }
        "wait" => {
            if step.seconds.is_none() {
                return Err("requires 'seconds'".to_string());
            }
        }
        "macro" | "include" => {
            if !present(&step.macro_name) {
                return Err("requires 'macro_name'".to_string());
            }
        }
        "wait_for_window" => {
            if !present(&step.title_contains) {
                return Err("requires 'title_contains'".to_string());
            }
        }
        "wait_for_enabled" => {
            if !any_criteria && !present(&step.target_ref) {
                return Err(
                    "requires at least one of 'automation_id', 'name', 'control_type', 'class_name', 'ref'"
                        .to_string(),
                );
            }
        }
        "file_dialog" => {
            if !present(&step.text) {
                return Err("requires 'text'".to_string());
            }
        }
        "attach" => {
            if !present(&step.process_name) && step.pid.is_none() {
                return Err("requires at least one of 'process_name', 'pid'".to_string());
            }
        }
        "verify" => {
            if !present(&step.target_ref) {
                return Err("requires 'ref'".to_string());
            }
            if !present(&step.property) {
                return Err("requires 'property'".to_string());
            }
            if !present(&step.expected) {
                return Err("requires 'expected'".to_string());
            }
        }
        _ => {}
    }

    Ok(())
}
