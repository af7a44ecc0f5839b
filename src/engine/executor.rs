//! The step interpreter: runs one macro against an automation backend.
//!
//! Per invocation it owns an [`AliasTable`], the resolved parameter map
//! and the macro deadline. Step failures, timeouts and backend faults are
//! always converted into a structured [`ExecutionResult`]; nothing raw
//! escapes to the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backend::{AutomationBackend, ElementRef, FindCriteria};
use crate::engine::substitute::{substitute, AliasTable};
use crate::engine::verify::{self, MatchMode};
use crate::engine::{CancelToken, EngineDefaults};
use crate::macros::loader::MacroTable;
use crate::macros::model::{MacroDefinition, Step, StepMeta};
use crate::types::{ExecutionResult, StepError};

/// Properties read by the `properties` step.
const INSPECTED_PROPERTIES: &[&str] = &[
    "name",
    "control_type",
    "automation_id",
    "class_name",
    "value",
    "enabled",
];

/// Runs macros from one table snapshot against one backend.
pub struct MacroExecutor {
    backend: Arc<dyn AutomationBackend>,
    table: Arc<MacroTable>,
    defaults: EngineDefaults,
}

impl MacroExecutor {
    pub fn new(backend: Arc<dyn AutomationBackend>, table: Arc<MacroTable>) -> Self {
        Self {
            backend,
            table,
            defaults: EngineDefaults::default(),
        }
    }

    /// Replace the built-in fallback timings, typically from the settings
    /// file's `[engine]` section.
    pub fn with_defaults(mut self, defaults: EngineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Run a macro by canonical name. Never returns a raw error; every
    /// outcome is an [`ExecutionResult`].
    pub async fn run(
        &self,
        name: &str,
        params: BTreeMap<String, String>,
        cancel: Option<CancelToken>,
    ) -> ExecutionResult {
        let Some(def) = self.table.get(name).cloned() else {
            return ExecutionResult::rejected(format!("unknown macro '{}'", name.trim()), 0);
        };
        self.run_macro(&def, params, None, None, cancel, None).await
    }

    /// Run one definition. Boxed because `macro` steps recurse.
    fn run_macro<'a>(
        &'a self,
        def: &'a MacroDefinition,
        caller_params: BTreeMap<String, String>,
        outer_deadline: Option<Instant>,
        timeout_override: Option<Duration>,
        cancel: Option<CancelToken>,
        parent_step: Option<usize>,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        let span = match parent_step {
            Some(step) => info_span!("macro", name = %def.name, parent_step = step),
            None => info_span!("macro", name = %def.name),
        };

        Box::pin(
            async move {
                let total = def.steps.len();

                let params = match resolve_parameters(def, &caller_params) {
                    Ok(params) => params,
                    Err(message) => {
                        warn!(error = %message, "Parameter resolution failed");
                        return ExecutionResult::rejected(message, total);
                    }
                };

                let macro_timeout = timeout_override.unwrap_or_else(|| {
                    if def.timeout > 0 {
                        Duration::from_secs(def.timeout)
                    } else {
                        self.defaults.macro_timeout
                    }
                });
                let mut deadline = Instant::now() + macro_timeout;
                if let Some(outer) = outer_deadline {
                    deadline = deadline.min(outer);
                }

                let started = Instant::now();
                let mut aliases = AliasTable::new();

                for (i, step) in def.steps.iter().enumerate() {
                    let index = i + 1;
                    let action = step.action();
                    let elapsed_ms = || started.elapsed().as_millis() as u64;

                    if Instant::now() >= deadline {
                        return ExecutionResult::failed_at(
                            index,
                            action,
                            StepError::MacroTimeout,
                            total,
                            elapsed_ms(),
                        );
                    }
                    if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                        return ExecutionResult::failed_at(
                            index,
                            action,
                            StepError::Cancelled,
                            total,
                            elapsed_ms(),
                        );
                    }

                    if !step.is_attachment_independent() {
                        match self.backend.is_attached().await {
                            Ok(true) => {}
                            Ok(false) => {
                                return ExecutionResult::failed_at(
                                    index,
                                    action,
                                    StepError::NotAttached,
                                    total,
                                    elapsed_ms(),
                                );
                            }
                            Err(e) => {
                                return ExecutionResult::failed_at(
                                    index,
                                    action,
                                    StepError::Backend(e.0),
                                    total,
                                    elapsed_ms(),
                                );
                            }
                        }
                    }

                    info!(
                        step = index,
                        total = total,
                        action = action,
                        "{}",
                        describe_step(step, &params)
                    );

                    let outcome = self
                        .run_step(step, index, &params, &mut aliases, deadline, &cancel)
                        .await;

                    if let Err(err) = outcome {
                        warn!(step = index, action = action, error = %err, "Step failed");
                        return ExecutionResult::failed_at(
                            index,
                            action,
                            err,
                            total,
                            elapsed_ms(),
                        );
                    }
                    debug!(step = index, action = action, "Step completed");
                }

                ExecutionResult::succeeded(total, started.elapsed().as_millis() as u64)
            }
            .instrument(span),
        )
    }

    /// Compose the step's own deadline with the macro deadline and the
    /// caller's cancellation, then dispatch. `wait`, `macro` and `include`
    /// manage their own timing and bypass the per-step timeout.
    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        params: &BTreeMap<String, String>,
        aliases: &mut AliasTable,
        macro_deadline: Instant,
        cancel: &Option<CancelToken>,
    ) -> Result<(), StepError> {
        match step {
            Step::Wait { seconds, .. } => {
                return self.do_wait(*seconds, macro_deadline, cancel).await;
            }
            Step::MacroCall {
                macro_name,
                params: call_params,
                meta,
                ..
            } => {
                return self
                    .do_nested_call(macro_name, call_params, meta, index, params, macro_deadline, cancel)
                    .await;
            }
            Step::Include { .. } => return Err(StepError::IncludeAtRuntime),
            _ => {}
        }

        let step_timeout = step
            .meta()
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.defaults.step_timeout);
        let wanted_deadline = Instant::now() + step_timeout;
        let step_deadline = wanted_deadline.min(macro_deadline);
        // When the macro deadline is the nearer bound, an elapse here is a
        // macro timeout, not the step's own.
        let timeout_error = move || {
            if macro_deadline < wanted_deadline {
                StepError::MacroTimeout
            } else {
                StepError::Timeout {
                    timeout_secs: step_timeout.as_secs(),
                }
            }
        };

        let dispatch = self.dispatch(step, params, aliases, step_deadline);
        tokio::pin!(dispatch);

        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StepError::Cancelled),
                result = timeout_at(step_deadline, &mut dispatch) => {
                    result.map_err(|_| timeout_error())?
                }
            },
            None => timeout_at(step_deadline, dispatch)
                .await
                .map_err(|_| timeout_error())?,
        }
    }

    /// A single cancellable sleep, truncated by the macro deadline.
    async fn do_wait(
        &self,
        seconds: f64,
        macro_deadline: Instant,
        cancel: &Option<CancelToken>,
    ) -> Result<(), StepError> {
        let wanted = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        let until = wanted.min(macro_deadline);

        let slept = async {
            sleep_until(until).await;
            if wanted > macro_deadline {
                Err(StepError::MacroTimeout)
            } else {
                Ok(())
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StepError::Cancelled),
                result = slept => result,
            },
            None => slept.await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_nested_call(
        &self,
        macro_name: &str,
        call_params: &BTreeMap<String, String>,
        meta: &StepMeta,
        index: usize,
        params: &BTreeMap<String, String>,
        macro_deadline: Instant,
        cancel: &Option<CancelToken>,
    ) -> Result<(), StepError> {
        let name = substitute(macro_name, params);
        let Some(target) = self.table.get(&name).cloned() else {
            return Err(StepError::UnknownMacro { name });
        };

        // The child's parameter map is the calling step's params with the
        // parent's parameters substituted in.
        let child_params: BTreeMap<String, String> = call_params
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, params)))
            .collect();

        let timeout_override = meta.timeout_secs.map(Duration::from_secs);
        let result = self
            .run_macro(
                &target,
                child_params,
                Some(macro_deadline),
                timeout_override,
                cancel.clone(),
                Some(index),
            )
            .await;

        if result.success {
            Ok(())
        } else {
            Err(StepError::NestedMacro {
                name,
                message: result.message,
            })
        }
    }

    /// Pass-through dispatch for all backend-facing actions. Every
    /// consumed string field is substituted exactly once on the way in.
    async fn dispatch(
        &self,
        step: &Step,
        params: &BTreeMap<String, String>,
        aliases: &mut AliasTable,
        step_deadline: Instant,
    ) -> Result<(), StepError> {
        let sub = |text: &str| substitute(text, params);
        let backend = &*self.backend;

        match step {
            Step::Focus { .. } => {
                backend.focus().await?;
            }
            Step::Attach {
                process_name, pid, ..
            } => {
                let name = process_name.as_deref().map(sub);
                backend.attach(name.as_deref(), *pid).await?;
            }
            Step::Snapshot { depth, .. } => {
                let tree = backend.snapshot(*depth).await?;
                debug!(chars = tree.len(), "Captured UI snapshot");
            }
            Step::Find {
                criteria,
                save_as,
                meta,
                ..
            } => {
                let criteria = substitute_criteria(criteria, params);
                let interval = retry_interval(meta, self.defaults.retry_interval);
                let handle = loop {
                    if let Some(handle) = backend.find(&criteria).await? {
                        break handle;
                    }
                    if Instant::now() + interval >= step_deadline {
                        return Err(StepError::NotFound {
                            criteria: criteria.to_string(),
                        });
                    }
                    sleep(interval).await;
                };
                register_alias(aliases, save_as, handle, &sub);
            }
            Step::FindByPath {
                path,
                save_as,
                meta,
                ..
            } => {
                let path = sub(path);
                let interval = retry_interval(meta, self.defaults.retry_interval);
                let handle = loop {
                    if let Some(handle) = backend.find_by_path(&path).await? {
                        break handle;
                    }
                    if Instant::now() + interval >= step_deadline {
                        return Err(StepError::NotFound {
                            criteria: format!("path={}", path),
                        });
                    }
                    sleep(interval).await;
                };
                register_alias(aliases, save_as, handle, &sub);
            }
            Step::Click { target, .. } => {
                let target = resolve_target(aliases, target, &sub);
                backend.click(&target).await?;
            }
            Step::RightClick { target, .. } => {
                let target = resolve_target(aliases, target, &sub);
                backend.right_click(&target).await?;
            }
            Step::TypeText { text, .. } => {
                backend.type_text(&sub(text)).await?;
            }
            Step::SetValue { target, value, .. } => {
                let target = aliases.resolve(&sub(target));
                backend.set_value(&target, &sub(value)).await?;
            }
            Step::GetValue { target, .. } => {
                let target = target.as_deref().map(|t| aliases.resolve(&sub(t)));
                let value = backend.get_value(target.as_ref()).await?;
                info!(value = %value, "Read value");
            }
            Step::SendKeys { keys, .. } => {
                backend.send_keys(&sub(keys)).await?;
            }
            Step::WaitForEnabled {
                criteria,
                target,
                enabled,
                meta,
                ..
            } => {
                self.wait_for_enabled(criteria, target.as_deref(), *enabled, meta, params, aliases, step_deadline)
                    .await?;
            }
            Step::Launch {
                path,
                args,
                working_dir,
                if_not_running,
                ..
            } => {
                let Some(path) = path.as_deref() else {
                    return Err(StepError::MissingField {
                        action: "launch",
                        field: "path",
                    });
                };
                let args = args.as_deref().map(sub);
                let dir = working_dir.as_deref().map(sub);
                let remaining = step_deadline.saturating_duration_since(Instant::now());
                backend
                    .launch_and_attach(&sub(path), args.as_deref(), dir.as_deref(), *if_not_running, remaining)
                    .await?;
            }
            Step::WaitForWindow { title_contains, .. } => {
                let remaining = step_deadline.saturating_duration_since(Instant::now());
                backend
                    .wait_for_window_ready(&sub(title_contains), remaining)
                    .await?;
            }
            Step::Screenshot { .. } => {
                let bytes = backend.screenshot().await?;
                info!(bytes = bytes.len(), "Captured screenshot");
            }
            Step::Properties { target, .. } => {
                let target = resolve_target(aliases, target, &sub);
                let mut read_any = false;
                for name in INSPECTED_PROPERTIES {
                    match backend.read_property(&target, name).await {
                        Ok(value) => {
                            read_any = true;
                            info!(property = name, value = %value, "Element property");
                        }
                        Err(e) => debug!(property = name, error = %e, "Property unavailable"),
                    }
                }
                if !read_any {
                    return Err(StepError::Backend(format!(
                        "no properties readable for '{}'",
                        target
                    )));
                }
            }
            Step::Children { target, .. } => {
                let target = target.as_deref().map(|t| aliases.resolve(&sub(t)));
                let children = backend.get_children(target.as_ref()).await?;
                info!(count = children.len(), "Listed children");
            }
            Step::FileDialog { text, .. } => {
                // drive the native dialog: type the path, confirm
                backend.type_text(&sub(text)).await?;
                backend.send_keys("{ENTER}").await?;
            }
            Step::Verify {
                target,
                property,
                expected,
                mode,
                message,
                ..
            } => {
                let handle = aliases.resolve(&sub(target));
                let property = sub(property);
                let expected = sub(expected);
                let mode = MatchMode::parse(mode.as_deref())?;
                let actual = backend.read_property(&handle, &property).await?;
                if !verify::matches(mode, &actual, &expected)? {
                    let message = message
                        .as_deref()
                        .map(sub)
                        .unwrap_or_else(|| {
                            verify::describe_failure(mode, &property, &actual, &expected)
                        });
                    return Err(StepError::VerifyFailed(message));
                }
            }
            Step::Wait { .. } | Step::MacroCall { .. } | Step::Include { .. } => {
                // handled in run_step before dispatch
                unreachable!("timed steps are dispatched separately");
            }
        }

        Ok(())
    }

    /// Retry with the find shape until the element reports the requested
    /// enabled state.
    #[allow(clippy::too_many_arguments)]
    async fn wait_for_enabled(
        &self,
        criteria: &FindCriteria,
        target: Option<&str>,
        want: bool,
        meta: &StepMeta,
        params: &BTreeMap<String, String>,
        aliases: &AliasTable,
        step_deadline: Instant,
    ) -> Result<(), StepError> {
        let sub = |text: &str| substitute(text, params);
        let interval = retry_interval(meta, self.defaults.retry_interval);
        let criteria = substitute_criteria(criteria, params);
        let described = match target {
            Some(t) => sub(t),
            None => criteria.to_string(),
        };

        loop {
            let handle = match target {
                Some(t) => Some(aliases.resolve(&sub(t))),
                None => self.backend.find(&criteria).await?,
            };
            if let Some(handle) = handle {
                if self.backend.is_enabled(&handle).await? == want {
                    return Ok(());
                }
            }
            if Instant::now() + interval >= step_deadline {
                return Err(StepError::NotEnabled {
                    target: described,
                    want,
                });
            }
            sleep(interval).await;
        }
    }
}

fn retry_interval(meta: &StepMeta, default: Duration) -> Duration {
    meta.retry_interval_ms.map(Duration::from_millis).unwrap_or(default)
}

fn resolve_target<F: Fn(&str) -> String>(
    aliases: &AliasTable,
    target: &Option<String>,
    sub: &F,
) -> ElementRef {
    match target {
        Some(t) => aliases.resolve(&sub(t)),
        None => ElementRef::new(""),
    }
}

fn register_alias<F: Fn(&str) -> String>(
    aliases: &mut AliasTable,
    save_as: &Option<String>,
    handle: ElementRef,
    sub: &F,
) {
    if let Some(save_as) = save_as {
        let name = sub(save_as);
        debug!(alias = %name, handle = %handle, "Registered alias");
        aliases.set(&name, handle);
    }
}

fn substitute_criteria(criteria: &FindCriteria, params: &BTreeMap<String, String>) -> FindCriteria {
    let sub = |field: &Option<String>| field.as_deref().map(|v| substitute(v, params));
    FindCriteria {
        automation_id: sub(&criteria.automation_id),
        name: sub(&criteria.name),
        control_type: sub(&criteria.control_type),
        class_name: sub(&criteria.class_name),
    }
}

/// Resolve the caller's parameter map against the macro's declared specs:
/// caller value wins, then the default; all required parameters missing
/// both are reported together. Caller extras pass through untouched.
fn resolve_parameters(
    def: &MacroDefinition,
    caller: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, String> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();

    for spec in &def.parameters {
        let supplied = caller
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&spec.name))
            .map(|(_, value)| value.clone());
        match supplied.or_else(|| spec.default.clone()) {
            Some(value) => {
                resolved.insert(spec.name.clone(), value);
            }
            None if spec.required => missing.push(spec.name.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        ));
    }

    for (name, value) in caller {
        if !resolved.keys().any(|r| r.eq_ignore_ascii_case(name)) {
            resolved.insert(name.clone(), value.clone());
        }
    }

    Ok(resolved)
}

/// Substituted one-line summary for the step log.
fn describe_step(step: &Step, params: &BTreeMap<String, String>) -> String {
    let sub = |text: &str| substitute(text, params);
    match step {
        Step::Focus { .. } => "focus the attached window".to_string(),
        Step::Attach {
            process_name, pid, ..
        } => match (process_name, pid) {
            (Some(name), _) => format!("attach to process '{}'", sub(name)),
            (None, Some(pid)) => format!("attach to pid {}", pid),
            (None, None) => "attach".to_string(),
        },
        Step::Snapshot { depth, .. } => match depth {
            Some(depth) => format!("snapshot UI tree (depth {})", depth),
            None => "snapshot UI tree".to_string(),
        },
        Step::Find { criteria, .. } => {
            format!("find element [{}]", substitute_criteria(criteria, params))
        }
        Step::FindByPath { path, .. } => format!("find element at path '{}'", sub(path)),
        Step::Click { target, .. } => match target {
            Some(t) => format!("click '{}'", sub(t)),
            None => "click".to_string(),
        },
        Step::RightClick { target, .. } => match target {
            Some(t) => format!("right-click '{}'", sub(t)),
            None => "right-click".to_string(),
        },
        Step::TypeText { text, .. } => format!("type '{}'", sub(text)),
        Step::SetValue { target, value, .. } => {
            format!("set '{}' = '{}'", sub(target), sub(value))
        }
        Step::GetValue { target, .. } => match target {
            Some(t) => format!("get value of '{}'", sub(t)),
            None => "get value".to_string(),
        },
        Step::SendKeys { keys, .. } => format!("send keys '{}'", sub(keys)),
        Step::Wait { seconds, .. } => format!("wait {}s", seconds),
        Step::WaitForEnabled {
            criteria,
            target,
            enabled,
            ..
        } => {
            let what = match target {
                Some(t) => sub(t),
                None => substitute_criteria(criteria, params).to_string(),
            };
            format!("wait until '{}' enabled={}", what, enabled)
        }
        Step::MacroCall { macro_name, .. } => format!("run macro '{}'", sub(macro_name)),
        Step::Include { macro_name, .. } => format!("include '{}'", sub(macro_name)),
        Step::Launch { path, .. } => match path {
            Some(path) => format!("launch '{}'", sub(path)),
            None => "launch".to_string(),
        },
        Step::WaitForWindow { title_contains, .. } => {
            format!("wait for window titled *{}*", sub(title_contains))
        }
        Step::Screenshot { .. } => "capture screenshot".to_string(),
        Step::Properties { target, .. } => match target {
            Some(t) => format!("read properties of '{}'", sub(t)),
            None => "read properties".to_string(),
        },
        Step::Children { target, .. } => match target {
            Some(t) => format!("list children of '{}'", sub(t)),
            None => "list children".to_string(),
        },
        Step::FileDialog { text, .. } => format!("file dialog: '{}'", sub(text)),
        Step::Verify {
            target,
            property,
            expected,
            mode,
            ..
        } => format!(
            "verify '{}'.{} {} '{}'",
            sub(target),
            sub(property),
            mode.as_deref().unwrap_or("equals"),
            sub(expected)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use crate::engine::CancelSource;
    use crate::macros::model::ParameterSpec;

    #[derive(Default)]
    struct MockBackend {
        attached: Mutex<bool>,
        calls: Mutex<Vec<String>>,
        find_queue: Mutex<VecDeque<Option<ElementRef>>>,
        find_always_misses: bool,
        enabled_queue: Mutex<VecDeque<bool>>,
        properties: Mutex<HashMap<(String, String), String>>,
        fail_action: Option<&'static str>,
        hang_action: Option<&'static str>,
    }

    impl MockBackend {
        fn attached() -> Self {
            let mock = Self::default();
            *mock.attached.lock().unwrap() = true;
            mock
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn check_fail(&self, action: &str) -> BackendResult<()> {
            if self.fail_action == Some(action) {
                Err(BackendError::new(format!("injected {action} failure")))
            } else {
                Ok(())
            }
        }

        async fn maybe_hang(&self, action: &str) {
            if self.hang_action == Some(action) {
                sleep(Duration::from_secs(600)).await;
            }
        }

        fn set_property(&self, target: &str, property: &str, value: &str) {
            self.properties
                .lock()
                .unwrap()
                .insert((target.to_string(), property.to_string()), value.to_string());
        }
    }

    #[async_trait]
    impl AutomationBackend for MockBackend {
        async fn attach(&self, process_name: Option<&str>, pid: Option<u32>) -> BackendResult<()> {
            self.check_fail("attach")?;
            self.record(format!(
                "attach {}",
                process_name
                    .map(str::to_string)
                    .or(pid.map(|p| p.to_string()))
                    .unwrap_or_default()
            ));
            *self.attached.lock().unwrap() = true;
            Ok(())
        }

        async fn find(&self, criteria: &FindCriteria) -> BackendResult<Option<ElementRef>> {
            self.check_fail("find")?;
            self.record(format!("find {}", criteria));
            if self.find_always_misses {
                return Ok(None);
            }
            let mut queue = self.find_queue.lock().unwrap();
            Ok(queue.pop_front().unwrap_or(Some(ElementRef::new("el-1"))))
        }

        async fn find_by_path(&self, path: &str) -> BackendResult<Option<ElementRef>> {
            self.check_fail("find_by_path")?;
            self.record(format!("find_by_path {path}"));
            if self.find_always_misses {
                return Ok(None);
            }
            let mut queue = self.find_queue.lock().unwrap();
            Ok(queue.pop_front().unwrap_or(Some(ElementRef::new("el-1"))))
        }

        async fn click(&self, target: &ElementRef) -> BackendResult<()> {
            self.check_fail("click")?;
            self.record(format!("click {target}"));
            Ok(())
        }

        async fn right_click(&self, target: &ElementRef) -> BackendResult<()> {
            self.check_fail("right_click")?;
            self.record(format!("right_click {target}"));
            Ok(())
        }

        async fn type_text(&self, text: &str) -> BackendResult<()> {
            self.check_fail("type_text")?;
            self.record(format!("type {text}"));
            Ok(())
        }

        async fn send_keys(&self, keys: &str) -> BackendResult<()> {
            self.check_fail("send_keys")?;
            self.record(format!("keys {keys}"));
            Ok(())
        }

        async fn set_value(&self, target: &ElementRef, value: &str) -> BackendResult<()> {
            self.check_fail("set_value")?;
            self.record(format!("set {target}={value}"));
            Ok(())
        }

        async fn get_value(&self, target: Option<&ElementRef>) -> BackendResult<String> {
            self.check_fail("get_value")?;
            self.record(format!(
                "get {}",
                target.map(ElementRef::to_string).unwrap_or_default()
            ));
            Ok("mock-value".to_string())
        }

        async fn read_property(&self, target: &ElementRef, name: &str) -> BackendResult<String> {
            self.check_fail("read_property")?;
            self.properties
                .lock()
                .unwrap()
                .get(&(target.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| BackendError::new(format!("no property '{name}' on '{target}'")))
        }

        async fn get_children(&self, _target: Option<&ElementRef>) -> BackendResult<Vec<ElementRef>> {
            self.check_fail("get_children")?;
            Ok(vec![ElementRef::new("el-c1"), ElementRef::new("el-c2")])
        }

        async fn focus(&self) -> BackendResult<()> {
            self.maybe_hang("focus").await;
            self.check_fail("focus")?;
            self.record("focus".to_string());
            Ok(())
        }

        async fn snapshot(&self, _depth: Option<u32>) -> BackendResult<String> {
            self.check_fail("snapshot")?;
            Ok("<window/>".to_string())
        }

        async fn screenshot(&self) -> BackendResult<Vec<u8>> {
            self.check_fail("screenshot")?;
            Ok(vec![0u8; 16])
        }

        async fn launch_and_attach(
            &self,
            path: &str,
            _args: Option<&str>,
            _working_dir: Option<&str>,
            _if_not_running: bool,
            _timeout: Duration,
        ) -> BackendResult<()> {
            self.check_fail("launch")?;
            self.record(format!("launch {path}"));
            *self.attached.lock().unwrap() = true;
            Ok(())
        }

        async fn wait_for_window_ready(
            &self,
            title_contains: &str,
            _timeout: Duration,
        ) -> BackendResult<()> {
            self.check_fail("wait_for_window")?;
            self.record(format!("wait_for_window {title_contains}"));
            Ok(())
        }

        async fn is_attached(&self) -> BackendResult<bool> {
            Ok(*self.attached.lock().unwrap())
        }

        async fn is_enabled(&self, _target: &ElementRef) -> BackendResult<bool> {
            self.check_fail("is_enabled")?;
            let mut queue = self.enabled_queue.lock().unwrap();
            Ok(queue.pop_front().unwrap_or(true))
        }
    }

    fn meta() -> StepMeta {
        StepMeta::default()
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

    fn executor(backend: MockBackend, defs: Vec<MacroDefinition>) -> (MacroExecutor, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let table = Arc::new(MacroTable::from_defs(defs));
        (
            MacroExecutor::new(backend.clone() as Arc<dyn AutomationBackend>, table),
            backend,
        )
    }

    fn no_params() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let steps = vec![
            Step::Attach {
                process_name: Some("notepad".to_string()),
                pid: None,
                meta: meta(),
            },
            Step::Focus { meta: meta() },
            Step::TypeText {
                text: "hello".to_string(),
                meta: meta(),
            },
        ];
        let (exec, mock) = executor(MockBackend::default(), vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.steps_executed, 3);
        assert_eq!(result.total_steps, 3);
        assert_eq!(mock.calls(), vec!["attach notepad", "focus", "type hello"]);
    }

    #[tokio::test]
    async fn test_failure_reports_step_index_and_partial_progress() {
        let mut backend = MockBackend::attached();
        backend.fail_action = Some("click");
        let steps = vec![
            Step::Focus { meta: meta() },
            Step::Focus { meta: meta() },
            Step::Click {
                target: Some("btn".to_string()),
                meta: meta(),
            },
            Step::Focus { meta: meta() },
        ];
        let (exec, _) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert_eq!(result.steps_executed, 2);
        assert_eq!(result.total_steps, 4);
        let failure = result.failure.expect("failure details");
        assert_eq!(failure.index, 3);
        assert_eq!(failure.action, "click");
        assert!(failure.error.contains("injected click failure"));
    }

    #[tokio::test]
    async fn test_unknown_macro_rejected() {
        let (exec, _) = executor(MockBackend::default(), vec![]);
        let result = exec.run("ghost", no_params(), None).await;
        assert!(!result.success);
        assert_eq!(result.steps_executed, 0);
        assert!(result.message.contains("unknown macro 'ghost'"));
    }

    #[tokio::test]
    async fn test_missing_required_parameters_collected_before_any_step() {
        let mut demo = def(
            "demo",
            vec![Step::TypeText {
                text: "{{a}} {{b}}".to_string(),
                meta: meta(),
            }],
        );
        demo.parameters = vec![
            ParameterSpec {
                name: "a".to_string(),
                description: String::new(),
                required: true,
                default: None,
            },
            ParameterSpec {
                name: "b".to_string(),
                description: String::new(),
                required: true,
                default: None,
            },
        ];
        let (exec, mock) = executor(MockBackend::attached(), vec![demo]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert_eq!(result.steps_executed, 0);
        assert!(result.message.contains("missing required parameter(s): a, b"));
        assert!(mock.calls().is_empty(), "no step may run");
    }

    #[tokio::test]
    async fn test_default_fills_required_parameter() {
        let mut demo = def(
            "demo",
            vec![Step::TypeText {
                text: "mode={{mode}}".to_string(),
                meta: meta(),
            }],
        );
        demo.parameters = vec![ParameterSpec {
            name: "mode".to_string(),
            description: String::new(),
            required: true,
            default: Some("fast".to_string()),
        }];
        let (exec, mock) = executor(MockBackend::attached(), vec![demo]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(mock.calls(), vec!["type mode=fast"]);
    }

    #[tokio::test]
    async fn test_unknown_tokens_stay_verbatim() {
        let steps = vec![Step::TypeText {
            text: "known={{user}} unknown={{nope}}".to_string(),
            meta: meta(),
        }];
        let (exec, mock) = executor(MockBackend::attached(), vec![def("demo", steps)]);

        let result = exec
            .run("demo", params(&[("user", "admin")]), None)
            .await;
        assert!(result.success);
        assert_eq!(mock.calls(), vec!["type known=admin unknown={{nope}}"]);
    }

    #[tokio::test]
    async fn test_detached_session_fails_dependent_step() {
        let steps = vec![Step::Focus { meta: meta() }];
        let (exec, _) = executor(MockBackend::default(), vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        let failure = result.failure.expect("failure details");
        assert_eq!(failure.index, 1);
        assert!(failure.error.contains("target process exited"));
    }

    #[tokio::test]
    async fn test_find_retries_then_registers_alias() {
        let backend = MockBackend::attached();
        backend
            .find_queue
            .lock()
            .unwrap()
            .extend([None, None, Some(ElementRef::new("el-9"))]);
        let steps = vec![
            Step::Find {
                criteria: FindCriteria {
                    name: Some("OK".to_string()),
                    ..Default::default()
                },
                save_as: Some("okBtn".to_string()),
                meta: StepMeta {
                    timeout_secs: Some(5),
                    retry_interval_ms: Some(10),
                },
            },
            Step::Click {
                target: Some("OKBTN".to_string()),
                meta: meta(),
            },
        ];
        let (exec, mock) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(
            mock.calls().iter().filter(|c| c.starts_with("find")).count(),
            3
        );
        assert!(mock.calls().contains(&"click el-9".to_string()));
    }

    #[tokio::test]
    async fn test_find_gives_not_found_after_deadline() {
        let mut backend = MockBackend::attached();
        backend.find_always_misses = true;
        let steps = vec![Step::Find {
            criteria: FindCriteria {
                automation_id: Some("gone".to_string()),
                ..Default::default()
            },
            save_as: None,
            meta: StepMeta {
                timeout_secs: Some(1),
                retry_interval_ms: Some(50),
            },
        }];
        let (exec, _) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        let failure = result.failure.expect("failure details");
        assert!(failure.error.contains("element not found"), "{}", failure.error);
        assert!(failure.error.contains("automation_id=gone"));
    }

    #[tokio::test]
    async fn test_verify_modes_through_backend() {
        let backend = MockBackend::attached();
        backend.set_property("status", "name", "Ready");
        let verify = |mode: &str, expected: &str| Step::Verify {
            target: "status".to_string(),
            property: "name".to_string(),
            expected: expected.to_string(),
            mode: Some(mode.to_string()),
            message: None,
            meta: meta(),
        };
        let (exec, _) = executor(
            backend,
            vec![
                def("ok_equals", vec![verify("equals", "READY")]),
                def("ok_contains", vec![verify("contains", "ead")]),
                def("bad_not_equals", vec![verify("not_equals", "ready")]),
                def("bad_mode", vec![verify("fuzzy", "Ready")]),
            ],
        );

        assert!(exec.run("ok_equals", no_params(), None).await.success);
        assert!(exec.run("ok_contains", no_params(), None).await.success);

        let result = exec.run("bad_not_equals", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("verification failed"));

        let result = exec.run("bad_mode", no_params(), None).await;
        assert!(!result.success);
        assert!(
            result.message.contains("unknown match mode 'fuzzy'"),
            "{}",
            result.message
        );
    }

    #[tokio::test]
    async fn test_verify_custom_message_substituted() {
        let backend = MockBackend::attached();
        backend.set_property("status", "name", "Failed");
        let steps = vec![Step::Verify {
            target: "status".to_string(),
            property: "name".to_string(),
            expected: "Ready".to_string(),
            mode: None,
            message: Some("{{env}} was not ready".to_string()),
            meta: meta(),
        }];
        let (exec, _) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", params(&[("env", "staging")]), None).await;
        assert!(!result.success);
        assert!(result.message.contains("staging was not ready"));
    }

    #[tokio::test]
    async fn test_nested_macro_params_and_fresh_aliases() {
        let child = {
            let mut d = def(
                "child",
                vec![
                    Step::TypeText {
                        text: "{{greeting}}".to_string(),
                        meta: meta(),
                    },
                    // the parent registered alias "okBtn"; a fresh table
                    // must resolve this literally
                    Step::Click {
                        target: Some("okBtn".to_string()),
                        meta: meta(),
                    },
                ],
            );
            d.parameters = vec![ParameterSpec {
                name: "greeting".to_string(),
                description: String::new(),
                required: true,
                default: None,
            }];
            d
        };
        let parent = def(
            "parent",
            vec![
                Step::Find {
                    criteria: FindCriteria {
                        name: Some("OK".to_string()),
                        ..Default::default()
                    },
                    save_as: Some("okBtn".to_string()),
                    meta: meta(),
                },
                Step::MacroCall {
                    macro_name: "child".to_string(),
                    params: params(&[("greeting", "hi {{who}}")]),
                    meta: meta(),
                },
            ],
        );
        let (exec, mock) = executor(MockBackend::attached(), vec![child, parent]);

        let result = exec.run("parent", params(&[("who", "world")]), None).await;
        assert!(result.success, "{}", result.message);
        let calls = mock.calls();
        assert!(calls.contains(&"type hi world".to_string()), "{calls:?}");
        // fresh alias table: "okBtn" resolves literally inside the child
        assert!(calls.contains(&"click okBtn".to_string()), "{calls:?}");
    }

    #[tokio::test]
    async fn test_nested_failure_surfaces_at_parent_step() {
        let mut backend = MockBackend::attached();
        backend.fail_action = Some("type_text");
        let child = def(
            "child",
            vec![Step::TypeText {
                text: "x".to_string(),
                meta: meta(),
            }],
        );
        let parent = def(
            "parent",
            vec![
                Step::Focus { meta: meta() },
                Step::MacroCall {
                    macro_name: "child".to_string(),
                    params: BTreeMap::new(),
                    meta: meta(),
                },
            ],
        );
        let (exec, _) = executor(backend, vec![child, parent]);

        let result = exec.run("parent", no_params(), None).await;
        assert!(!result.success);
        let failure = result.failure.expect("failure details");
        assert_eq!(failure.index, 2);
        assert_eq!(failure.action, "macro");
        assert!(failure.error.contains("macro 'child' failed"));
    }

    #[tokio::test]
    async fn test_unknown_nested_macro() {
        let parent = def(
            "parent",
            vec![Step::MacroCall {
                macro_name: "ghost".to_string(),
                params: BTreeMap::new(),
                meta: meta(),
            }],
        );
        let (exec, _) = executor(MockBackend::attached(), vec![parent]);

        let result = exec.run("parent", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("unknown macro 'ghost'"));
    }

    #[tokio::test]
    async fn test_include_at_runtime_is_configuration_error() {
        let demo = def(
            "demo",
            vec![Step::Include {
                macro_name: "other".to_string(),
                params: BTreeMap::new(),
                meta: meta(),
            }],
        );
        let (exec, _) = executor(MockBackend::attached(), vec![demo]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("expanded at load time"));
    }

    #[tokio::test]
    async fn test_wait_sleeps_and_succeeds() {
        let steps = vec![Step::Wait {
            seconds: 0.05,
            meta: meta(),
        }];
        let (exec, _) = executor(MockBackend::default(), vec![def("demo", steps)]);
        let result = exec.run("demo", no_params(), None).await;
        assert!(result.success);
        assert!(result.duration_ms >= 40);
    }

    #[tokio::test]
    async fn test_macro_deadline_truncates_wait() {
        let mut demo = def(
            "demo",
            vec![Step::Wait {
                seconds: 30.0,
                meta: meta(),
            }],
        );
        demo.timeout = 1;
        let (exec, _) = executor(MockBackend::default(), vec![demo]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("macro deadline elapsed"));
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_macro_deadline_clamping_step_reported_as_macro_timeout() {
        let mut backend = MockBackend::attached();
        backend.hang_action = Some("focus");
        // default step timeout is much longer; the 1 s macro deadline is
        // the bound that actually fires
        let mut demo = def("demo", vec![Step::Focus { meta: meta() }]);
        demo.timeout = 1;
        let (exec, _) = executor(backend, vec![demo]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(
            result.message.contains("macro deadline elapsed"),
            "{}",
            result.message
        );
        assert!(!result.message.contains("step timed out"), "{}", result.message);
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_step_timeout_reported_with_step_seconds() {
        let mut backend = MockBackend::attached();
        backend.hang_action = Some("focus");
        let steps = vec![Step::Focus {
            meta: StepMeta {
                timeout_secs: Some(1),
                retry_interval_ms: None,
            },
        }];
        let (exec, _) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(
            result.message.contains("step timed out after 1s"),
            "{}",
            result.message
        );
    }

    #[tokio::test]
    async fn test_nested_macro_bounded_by_parent_deadline() {
        let mut child = def(
            "child",
            vec![Step::Wait {
                seconds: 30.0,
                meta: meta(),
            }],
        );
        child.timeout = 60;
        let mut parent = def(
            "parent",
            vec![Step::MacroCall {
                macro_name: "child".to_string(),
                params: BTreeMap::new(),
                meta: meta(),
            }],
        );
        parent.timeout = 1;
        let (exec, _) = executor(MockBackend::default(), vec![child, parent]);

        let result = exec.run("parent", no_params(), None).await;
        assert!(!result.success);
        // the child's own 60 s budget must not outlive the parent's
        assert!(result.duration_ms < 5_000);
        let failure = result.failure.expect("failure details");
        assert_eq!(failure.action, "macro");
        assert!(failure.error.contains("macro 'child' failed"), "{}", failure.error);
        assert!(failure.error.contains("macro deadline elapsed"), "{}", failure.error);
    }

    #[tokio::test]
    async fn test_step_timeout_override_wins_over_child_declared_timeout() {
        let mut child = def(
            "child",
            vec![Step::Wait {
                seconds: 30.0,
                meta: meta(),
            }],
        );
        child.timeout = 60;
        let parent = def(
            "parent",
            vec![Step::MacroCall {
                macro_name: "child".to_string(),
                params: BTreeMap::new(),
                meta: StepMeta {
                    timeout_secs: Some(1),
                    retry_interval_ms: None,
                },
            }],
        );
        let (exec, _) = executor(MockBackend::default(), vec![child, parent]);

        let result = exec.run("parent", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("macro 'child' failed"), "{}", result.message);
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_configured_defaults_replace_builtin_timings() {
        let mut backend = MockBackend::attached();
        backend.find_always_misses = true;
        let steps = vec![Step::Find {
            criteria: FindCriteria {
                automation_id: Some("gone".to_string()),
                ..Default::default()
            },
            save_as: None,
            meta: meta(),
        }];
        let backend = Arc::new(backend);
        let table = Arc::new(MacroTable::from_defs(vec![def("demo", steps)]));
        let exec = MacroExecutor::new(backend as Arc<dyn AutomationBackend>, table)
            .with_defaults(EngineDefaults {
                step_timeout: Duration::from_millis(200),
                retry_interval: Duration::from_millis(20),
                ..EngineDefaults::default()
            });

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("element not found"), "{}", result.message);
        // the built-in 15 s step timeout would keep this polling far longer
        assert!(result.duration_ms < 2_000);
    }

    #[tokio::test]
    async fn test_configured_macro_timeout_bounds_untimed_macro() {
        let demo = def(
            "demo",
            vec![Step::Wait {
                seconds: 30.0,
                meta: meta(),
            }],
        );
        let backend = Arc::new(MockBackend::default());
        let table = Arc::new(MacroTable::from_defs(vec![demo]));
        let exec = MacroExecutor::new(backend as Arc<dyn AutomationBackend>, table)
            .with_defaults(EngineDefaults {
                macro_timeout: Duration::from_millis(200),
                ..EngineDefaults::default()
            });

        let result = exec.run("demo", no_params(), None).await;
        assert!(!result.success);
        assert!(result.message.contains("macro deadline elapsed"), "{}", result.message);
        assert!(result.duration_ms < 2_000);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let demo = def(
            "demo",
            vec![Step::Wait {
                seconds: 30.0,
                meta: meta(),
            }],
        );
        let (exec, _) = executor(MockBackend::default(), vec![demo]);
        let (source, token) = CancelSource::new();

        let run = tokio::spawn(async move { exec.run("demo", no_params(), Some(token)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.cancel();

        let result = run.await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("execution cancelled"));
    }

    #[tokio::test]
    async fn test_wait_for_enabled_polls_until_state() {
        let backend = MockBackend::attached();
        backend
            .enabled_queue
            .lock()
            .unwrap()
            .extend([false, false, true]);
        let steps = vec![Step::WaitForEnabled {
            criteria: FindCriteria::default(),
            target: Some("saveBtn".to_string()),
            enabled: true,
            meta: StepMeta {
                timeout_secs: Some(5),
                retry_interval_ms: Some(10),
            },
        }];
        let (exec, _) = executor(backend, vec![def("demo", steps)]);

        let result = exec.run("demo", no_params(), None).await;
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn test_file_dialog_types_then_confirms() {
        let steps = vec![Step::FileDialog {
            text: "C:/tmp/{{file}}".to_string(),
            meta: meta(),
        }];
        let (exec, mock) = executor(MockBackend::attached(), vec![def("demo", steps)]);

        let result = exec
            .run("demo", params(&[("file", "out.txt")]), None)
            .await;
        assert!(result.success);
        assert_eq!(
            mock.calls(),
            vec!["type C:/tmp/out.txt", "keys {ENTER}"]
        );
    }
}
