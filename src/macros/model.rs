//! Macro and step data model.
//!
//! Macro documents parse into [`MacroDocument`] / [`RawStep`] (a flat,
//! permissive shape), pass through the step validator, and are then
//! converted into the closed [`Step`] enum that the executor dispatches on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::backend::FindCriteria;

/// A macro document as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Macro-level timeout in seconds; 0 means "use the engine default".
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

/// A declared macro parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// One step as parsed from a document, before validation. Every field is
/// optional except `action`; the validator decides which combinations are
/// acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStep {
    pub action: String,

    // find / wait_for_enabled criteria
    pub automation_id: Option<String>,
    pub name: Option<String>,
    pub control_type: Option<String>,
    pub class_name: Option<String>,

    // element addressing
    pub path: Option<String>,
    #[serde(rename = "ref")]
    pub target_ref: Option<String>,
    pub save_as: Option<String>,

    // action payloads
    pub value: Option<String>,
    pub text: Option<String>,
    pub keys: Option<String>,
    pub seconds: Option<f64>,
    pub title_contains: Option<String>,
    pub process_name: Option<String>,
    pub pid: Option<u32>,
    pub depth: Option<u32>,
    pub args: Option<String>,
    pub working_dir: Option<String>,
    pub if_not_running: Option<bool>,
    pub enabled: Option<bool>,

    // nested macros / includes
    pub macro_name: Option<String>,
    pub params: Option<BTreeMap<String, String>>,

    // verification
    pub property: Option<String>,
    pub expected: Option<String>,
    pub mode: Option<String>,
    pub message: Option<String>,

    // per-step overrides
    pub timeout_secs: Option<u64>,
    pub retry_interval_ms: Option<u64>,
}

impl RawStep {
    /// Canonical lowercase action name, with the `keys` alias folded into
    /// `send_keys`.
    pub fn canonical_action(&self) -> String {
        let action = self.action.trim().to_ascii_lowercase();
        if action == "keys" {
            "send_keys".to_string()
        } else {
            action
        }
    }
}

/// Per-step timing overrides shared by every action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMeta {
    pub timeout_secs: Option<u64>,
    pub retry_interval_ms: Option<u64>,
}

/// A validated step. Closed over the fixed action vocabulary so that the
/// validator and the dispatcher are exhaustive matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Focus {
        meta: StepMeta,
    },
    Attach {
        process_name: Option<String>,
        pid: Option<u32>,
        meta: StepMeta,
    },
    Snapshot {
        depth: Option<u32>,
        meta: StepMeta,
    },
    Find {
        criteria: FindCriteria,
        save_as: Option<String>,
        meta: StepMeta,
    },
    FindByPath {
        path: String,
        save_as: Option<String>,
        meta: StepMeta,
    },
    Click {
        target: Option<String>,
        meta: StepMeta,
    },
    RightClick {
        target: Option<String>,
        meta: StepMeta,
    },
    TypeText {
        text: String,
        meta: StepMeta,
    },
    SetValue {
        target: String,
        value: String,
        meta: StepMeta,
    },
    GetValue {
        target: Option<String>,
        meta: StepMeta,
    },
    SendKeys {
        keys: String,
        meta: StepMeta,
    },
    Wait {
        seconds: f64,
        meta: StepMeta,
    },
    WaitForEnabled {
        criteria: FindCriteria,
        target: Option<String>,
        enabled: bool,
        meta: StepMeta,
    },
    MacroCall {
        macro_name: String,
        params: BTreeMap<String, String>,
        meta: StepMeta,
    },
    /// Present only between parse and include expansion; reaching the
    /// executor with one of these is a configuration error.
    Include {
        macro_name: String,
        params: BTreeMap<String, String>,
        meta: StepMeta,
    },
    Launch {
        path: Option<String>,
        args: Option<String>,
        working_dir: Option<String>,
        if_not_running: bool,
        meta: StepMeta,
    },
    WaitForWindow {
        title_contains: String,
        meta: StepMeta,
    },
    Screenshot {
        meta: StepMeta,
    },
    Properties {
        target: Option<String>,
        meta: StepMeta,
    },
    Children {
        target: Option<String>,
        meta: StepMeta,
    },
    FileDialog {
        text: String,
        meta: StepMeta,
    },
    Verify {
        target: String,
        property: String,
        expected: String,
        mode: Option<String>,
        message: Option<String>,
        meta: StepMeta,
    },
}

impl Step {
    /// Build a step from a raw step that already passed validation.
    /// Mandatory fields are taken as-present; absent ones fall back to
    /// empty values rather than panicking, since the validator is the
    /// gatekeeper.
    pub fn from_raw(raw: &RawStep) -> Option<Step> {
        let meta = StepMeta {
            timeout_secs: raw.timeout_secs,
            retry_interval_ms: raw.retry_interval_ms,
        };
        let criteria = FindCriteria {
            automation_id: raw.automation_id.clone(),
            name: raw.name.clone(),
            control_type: raw.control_type.clone(),
            class_name: raw.class_name.clone(),
        };
        let step = match raw.canonical_action().as_str() {
            "focus" => Step::Focus { meta },
            "attach" => Step::Attach {
                process_name: raw.process_name.clone(),
                pid: raw.pid,
                meta,
            },
            "snapshot" => Step::Snapshot {
                depth: raw.depth,
                meta,
            },
            "find" => Step::Find {
                criteria,
                save_as: raw.save_as.clone(),
                meta,
            },
            "find_by_path" => Step::FindByPath {
                path: raw.path.clone().unwrap_or_default(),
                save_as: raw.save_as.clone(),
                meta,
            },
            "click" => Step::Click {
                target: raw.target_ref.clone(),
                meta,
            },
            "right_click" => Step::RightClick {
                target: raw.target_ref.clone(),
                meta,
            },
            "type" => Step::TypeText {
                text: raw.text.clone().unwrap_or_default(),
                meta,
            },
            "set_value" => Step::SetValue {
                target: raw.target_ref.clone().unwrap_or_default(),
                value: raw.value.clone().unwrap_or_default(),
                meta,
            },
            "get_value" => Step::GetValue {
                target: raw.target_ref.clone(),
                meta,
            },
            "send_keys" => Step::SendKeys {
                keys: raw.keys.clone().unwrap_or_default(),
                meta,
            },
            "wait" => Step::Wait {
                seconds: raw.seconds.unwrap_or(0.0),
                meta,
            },
            "wait_for_enabled" => Step::WaitForEnabled {
                criteria,
                target: raw.target_ref.clone(),
                enabled: raw.enabled.unwrap_or(true),
                meta,
            },
            "macro" => Step::MacroCall {
                macro_name: raw.macro_name.clone().unwrap_or_default(),
                params: raw.params.clone().unwrap_or_default(),
                meta,
            },
            "include" => Step::Include {
                macro_name: raw.macro_name.clone().unwrap_or_default(),
                params: raw.params.clone().unwrap_or_default(),
                meta,
            },
            "launch" => Step::Launch {
                path: raw.path.clone(),
                args: raw.args.clone(),
                working_dir: raw.working_dir.clone(),
                if_not_running: raw.if_not_running.unwrap_or(true),
                meta,
            },
            "wait_for_window" => Step::WaitForWindow {
                title_contains: raw.title_contains.clone().unwrap_or_default(),
                meta,
            },
            "screenshot" => Step::Screenshot { meta },
            "properties" => Step::Properties {
                target: raw.target_ref.clone(),
                meta,
            },
            "children" => Step::Children {
                target: raw.target_ref.clone(),
                meta,
            },
            "file_dialog" => Step::FileDialog {
                text: raw.text.clone().unwrap_or_default(),
                meta,
            },
            "verify" => Step::Verify {
                target: raw.target_ref.clone().unwrap_or_default(),
                property: raw.property.clone().unwrap_or_default(),
                expected: raw.expected.clone().unwrap_or_default(),
                mode: raw.mode.clone(),
                message: raw.message.clone(),
                meta,
            },
            _ => return None,
        };
        Some(step)
    }

    /// The canonical action name, used in logs and failure reports.
    pub fn action(&self) -> &'static str {
        match self {
            Step::Focus { .. } => "focus",
            Step::Attach { .. } => "attach",
            Step::Snapshot { .. } => "snapshot",
            Step::Find { .. } => "find",
            Step::FindByPath { .. } => "find_by_path",
            Step::Click { .. } => "click",
            Step::RightClick { .. } => "right_click",
            Step::TypeText { .. } => "type",
            Step::SetValue { .. } => "set_value",
            Step::GetValue { .. } => "get_value",
            Step::SendKeys { .. } => "send_keys",
            Step::Wait { .. } => "wait",
            Step::WaitForEnabled { .. } => "wait_for_enabled",
            Step::MacroCall { .. } => "macro",
            Step::Include { .. } => "include",
            Step::Launch { .. } => "launch",
            Step::WaitForWindow { .. } => "wait_for_window",
            Step::Screenshot { .. } => "screenshot",
            Step::Properties { .. } => "properties",
            Step::Children { .. } => "children",
            Step::FileDialog { .. } => "file_dialog",
            Step::Verify { .. } => "verify",
        }
    }

    /// Actions that may run while no target process is attached.
    pub fn is_attachment_independent(&self) -> bool {
        matches!(
            self,
            Step::Attach { .. }
                | Step::Wait { .. }
                | Step::MacroCall { .. }
                | Step::Include { .. }
                | Step::Launch { .. }
                | Step::WaitForWindow { .. }
        )
    }

    pub fn meta(&self) -> &StepMeta {
        match self {
            Step::Focus { meta }
            | Step::Attach { meta, .. }
            | Step::Snapshot { meta, .. }
            | Step::Find { meta, .. }
            | Step::FindByPath { meta, .. }
            | Step::Click { meta, .. }
            | Step::RightClick { meta, .. }
            | Step::TypeText { meta, .. }
            | Step::SetValue { meta, .. }
            | Step::GetValue { meta, .. }
            | Step::SendKeys { meta, .. }
            | Step::Wait { meta, .. }
            | Step::WaitForEnabled { meta, .. }
            | Step::MacroCall { meta, .. }
            | Step::Include { meta, .. }
            | Step::Launch { meta, .. }
            | Step::WaitForWindow { meta, .. }
            | Step::Screenshot { meta }
            | Step::Properties { meta, .. }
            | Step::Children { meta, .. }
            | Step::FileDialog { meta, .. }
            | Step::Verify { meta, .. } => meta,
        }
    }

    /// Rewrite every string field through `f`. Used by include expansion
    /// to remap `{{childParam}}` tokens; map values are rewritten, map
    /// keys are not.
    pub fn map_strings<F: Fn(&str) -> String>(&mut self, f: F) {
        fn apply<F: Fn(&str) -> String>(s: &mut String, f: &F) {
            *s = f(s);
        }
        fn apply_opt<F: Fn(&str) -> String>(s: &mut Option<String>, f: &F) {
            if let Some(v) = s {
                *v = f(v);
            }
        }
        fn apply_criteria<F: Fn(&str) -> String>(c: &mut FindCriteria, f: &F) {
            apply_opt(&mut c.automation_id, f);
            apply_opt(&mut c.name, f);
            apply_opt(&mut c.control_type, f);
            apply_opt(&mut c.class_name, f);
        }
        fn apply_params<F: Fn(&str) -> String>(p: &mut BTreeMap<String, String>, f: &F) {
            for value in p.values_mut() {
                *value = f(value);
            }
        }

        let f = &f;
        match self {
            Step::Focus { .. } | Step::Screenshot { .. } => {}
            Step::Attach { process_name, .. } => apply_opt(process_name, f),
            Step::Snapshot { .. } => {}
            Step::Find {
                criteria, save_as, ..
            } => {
                apply_criteria(criteria, f);
                apply_opt(save_as, f);
            }
            Step::FindByPath { path, save_as, .. } => {
                apply(path, f);
                apply_opt(save_as, f);
            }
            Step::Click { target, .. }
            | Step::RightClick { target, .. }
            | Step::Properties { target, .. }
            | Step::Children { target, .. } => apply_opt(target, f),
            Step::TypeText { text, .. } | Step::FileDialog { text, .. } => apply(text, f),
            Step::SetValue { target, value, .. } => {
                apply(target, f);
                apply(value, f);
            }
            Step::GetValue { target, .. } => apply_opt(target, f),
            Step::SendKeys { keys, .. } => apply(keys, f),
            Step::Wait { .. } => {}
            Step::WaitForEnabled {
                criteria, target, ..
            } => {
                apply_criteria(criteria, f);
                apply_opt(target, f);
            }
            Step::MacroCall {
                macro_name, params, ..
            }
            | Step::Include {
                macro_name, params, ..
            } => {
                apply(macro_name, f);
                apply_params(params, f);
            }
            Step::Launch {
                path,
                args,
                working_dir,
                ..
            } => {
                apply_opt(path, f);
                apply_opt(args, f);
                apply_opt(working_dir, f);
            }
            Step::WaitForWindow { title_contains, .. } => apply(title_contains, f),
            Step::Verify {
                target,
                property,
                expected,
                message,
                ..
            } => {
                apply(target, f);
                apply(property, f);
                apply(expected, f);
                apply_opt(message, f);
            }
        }
    }
}

/// A loaded, validated macro. Created by the loader, rewritten only by
/// include expansion within the same load pass, and replaced wholesale on
/// reload.
#[derive(Debug, Clone)]
pub struct MacroDefinition {
    /// Canonical, case-insensitive, slash-joined name derived from the
    /// source file's relative path.
    pub name: String,
    /// The file this macro was loaded from.
    pub source_path: std::path::PathBuf,
    /// The document's own `name` field, kept for display.
    pub display_name: String,
    pub description: String,
    /// Seconds; 0 means "use the engine default".
    pub timeout: u64,
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<Step>,
}

impl MacroDefinition {
    pub fn has_includes(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Include { .. }))
    }
}
