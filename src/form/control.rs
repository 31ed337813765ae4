use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures_timer::Delay;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::path::{ControlPath, PathSegment};
use super::stream::ChangeStream;
use super::validation::{
    AsyncValidator, BoxedValidationFuture, ValidationErrors, Validator, normalize_errors,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStatus {
    Valid,
    Invalid,
    Pending,
    Disabled,
}

impl Display for ControlStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ControlStatus::Valid => "VALID",
            ControlStatus::Invalid => "INVALID",
            ControlStatus::Pending => "PENDING",
            ControlStatus::Disabled => "DISABLED",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ControlKind {
    Leaf,
    Group,
    Array,
}

impl Display for ControlKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ControlKind::Leaf => "leaf",
            ControlKind::Group => "group",
            ControlKind::Array => "array",
        })
    }
}

/// Which UI event the write-back layer should commit values on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOn {
    #[default]
    Change,
    Blur,
    Submit,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ControlOptions {
    pub update_on: UpdateOn,
    /// Reset falls back to the initial value instead of `null`.
    pub non_nullable: bool,
    pub async_debounce: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UpdateOptions {
    /// Do not propagate the change to ancestors.
    pub only_self: bool,
    pub emit_event: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            only_self: false,
            emit_event: true,
        }
    }
}

impl UpdateOptions {
    pub fn silent() -> Self {
        Self {
            emit_event: false,
            ..Self::default()
        }
    }

    pub fn only_self() -> Self {
        Self {
            only_self: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

impl ValidationTicket {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FormError {
    #[error("expected a {expected} control, found a {found}")]
    KindMismatch {
        expected: ControlKind,
        found: ControlKind,
    },
    #[error("a control named `{0}` is already registered")]
    DuplicateControl(String),
    #[error("no control named `{0}` is registered")]
    MissingControl(String),
    #[error("value for control `{0}` is missing")]
    MissingValue(String),
    #[error("index {index} is out of range for an array of {len} controls")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("a {kind} control cannot take a {found} value")]
    ValueShape {
        kind: ControlKind,
        found: &'static str,
    },
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

pub type FormResult<T> = Result<T, FormError>;

enum Children {
    Leaf,
    Group(Vec<(String, Control)>),
    Array(Vec<Control>),
}

struct ControlState {
    value: Value,
    default_value: Value,
    status: ControlStatus,
    errors: Option<ValidationErrors>,
    pristine: bool,
    touched: bool,
    ticket: ValidationTicket,
    async_in_flight: bool,
}

struct PendingValidation {
    ticket: ValidationTicket,
    emit_event: bool,
    future: BoxedValidationFuture,
}

/// A validation taken out of its control's slot by `settle`. Returned to the
/// slot on drop unless it finished or was superseded.
struct PendingClaim {
    control: Control,
    pending: Option<PendingValidation>,
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let mut slot = self.control.pending_lock();
        if slot.is_none() && self.control.is_latest_ticket(pending.ticket) {
            trace!(ticket = pending.ticket.0, "returning unfinished async validation");
            *slot = Some(pending);
        }
    }
}

struct ControlNode {
    kind: ControlKind,
    options: ControlOptions,
    validator: Option<Arc<dyn Validator>>,
    async_validator: Option<Arc<dyn AsyncValidator>>,
    state: RwLock<ControlState>,
    children: RwLock<Children>,
    parent: RwLock<Weak<ControlNode>>,
    pending: Mutex<Option<PendingValidation>>,
    value_changes: ChangeStream<Value>,
    status_changes: ChangeStream<ControlStatus>,
}

/// Shared handle onto one node of a form-control tree.
///
/// Cloning is cheap and yields another handle onto the same node. A child
/// only keeps a weak link to its parent, so the tree is owned by whoever
/// holds the root.
#[derive(Clone)]
pub struct Control {
    node: Arc<ControlNode>,
}

/// Non-owning handle, see [`Control::downgrade`].
#[derive(Clone, Default)]
pub struct WeakControl {
    node: Weak<ControlNode>,
}

impl WeakControl {
    pub fn upgrade(&self) -> Option<Control> {
        self.node.upgrade().map(|node| Control { node })
    }
}

impl Debug for WeakControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakControl")
            .field("alive", &(self.node.strong_count() > 0))
            .finish()
    }
}

impl Debug for Control {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("Control")
            .field("kind", &self.node.kind)
            .field("status", &state.status)
            .field("value", &state.value)
            .field("errors", &state.errors)
            .field("pristine", &state.pristine)
            .field("touched", &state.touched)
            .finish()
    }
}

pub struct ControlBuilder {
    children: Children,
    value: Value,
    options: ControlOptions,
    validator: Option<Arc<dyn Validator>>,
    async_validator: Option<Arc<dyn AsyncValidator>>,
    disabled: bool,
}

impl ControlBuilder {
    pub fn leaf(value: impl Into<Value>) -> Self {
        Self::with_children(Children::Leaf, value.into())
    }

    /// Later entries replace earlier ones with the same name.
    pub fn group<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Control)>,
        K: Into<String>,
    {
        let mut entries: Vec<(String, Control)> = Vec::new();
        for (name, control) in children {
            let name = name.into();
            match entries.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => entry.1 = control,
                None => entries.push((name, control)),
            }
        }
        Self::with_children(Children::Group(entries), Value::Object(Map::new()))
    }

    pub fn array(children: impl IntoIterator<Item = Control>) -> Self {
        Self::with_children(
            Children::Array(children.into_iter().collect()),
            Value::Array(Vec::new()),
        )
    }

    fn with_children(children: Children, value: Value) -> Self {
        Self {
            children,
            value,
            options: ControlOptions::default(),
            validator: None,
            async_validator: None,
            disabled: false,
        }
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn async_validator(mut self, validator: impl AsyncValidator + 'static) -> Self {
        self.async_validator = Some(Arc::new(validator));
        self
    }

    pub fn options(mut self, options: ControlOptions) -> Self {
        self.options = options;
        self
    }

    pub fn update_on(mut self, update_on: UpdateOn) -> Self {
        self.options.update_on = update_on;
        self
    }

    pub fn non_nullable(mut self, non_nullable: bool) -> Self {
        self.options.non_nullable = non_nullable;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.options.async_debounce = debounce;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn build(self) -> Control {
        let kind = match self.children {
            Children::Leaf => ControlKind::Leaf,
            Children::Group(_) => ControlKind::Group,
            Children::Array(_) => ControlKind::Array,
        };
        let default_value = if self.options.non_nullable {
            self.value.clone()
        } else {
            Value::Null
        };
        let control = Control {
            node: Arc::new(ControlNode {
                kind,
                options: self.options,
                validator: self.validator,
                async_validator: self.async_validator,
                state: RwLock::new(ControlState {
                    value: self.value,
                    default_value,
                    status: ControlStatus::Valid,
                    errors: None,
                    pristine: true,
                    touched: false,
                    ticket: ValidationTicket::default(),
                    async_in_flight: false,
                }),
                children: RwLock::new(self.children),
                parent: RwLock::new(Weak::new()),
                pending: Mutex::new(None),
                value_changes: ChangeStream::new(),
                status_changes: ChangeStream::new(),
            }),
        };
        for child in control.controls() {
            child.attach_to(&control);
        }

        let quiet = UpdateOptions {
            only_self: true,
            emit_event: false,
        };
        if self.disabled {
            control.disable(quiet);
        } else {
            control.update_value_and_validity(quiet);
        }
        control
    }
}

impl Control {
    pub fn leaf(value: impl Into<Value>) -> Self {
        ControlBuilder::leaf(value).build()
    }

    pub fn group<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Control)>,
        K: Into<String>,
    {
        ControlBuilder::group(children).build()
    }

    pub fn array(children: impl IntoIterator<Item = Control>) -> Self {
        ControlBuilder::array(children).build()
    }

    pub fn downgrade(&self) -> WeakControl {
        WeakControl {
            node: Arc::downgrade(&self.node),
        }
    }

    pub fn ptr_eq(&self, other: &Control) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn kind(&self) -> ControlKind {
        self.node.kind
    }

    pub fn options(&self) -> ControlOptions {
        self.node.options
    }

    pub fn update_on(&self) -> UpdateOn {
        self.node.options.update_on
    }

    pub fn value(&self) -> Value {
        self.read_state().value.clone()
    }

    /// Value including disabled descendants.
    pub fn raw_value(&self) -> Value {
        match &*read_lock(&self.node.children, "reading raw value") {
            Children::Leaf => self.value(),
            Children::Group(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(name, child)| (name.clone(), child.raw_value()))
                    .collect(),
            ),
            Children::Array(items) => Value::Array(items.iter().map(Control::raw_value).collect()),
        }
    }

    pub fn status(&self) -> ControlStatus {
        self.read_state().status
    }

    pub fn valid(&self) -> bool {
        self.status() == ControlStatus::Valid
    }

    pub fn invalid(&self) -> bool {
        self.status() == ControlStatus::Invalid
    }

    pub fn pending(&self) -> bool {
        self.status() == ControlStatus::Pending
    }

    pub fn disabled(&self) -> bool {
        self.status() == ControlStatus::Disabled
    }

    pub fn enabled(&self) -> bool {
        !self.disabled()
    }

    pub fn errors(&self) -> Option<ValidationErrors> {
        self.read_state().errors.clone()
    }

    pub fn pristine(&self) -> bool {
        self.read_state().pristine
    }

    pub fn dirty(&self) -> bool {
        !self.pristine()
    }

    pub fn touched(&self) -> bool {
        self.read_state().touched
    }

    pub fn untouched(&self) -> bool {
        !self.touched()
    }

    pub fn value_changes(&self) -> ChangeStream<Value> {
        self.node.value_changes.clone()
    }

    pub fn status_changes(&self) -> ChangeStream<ControlStatus> {
        self.node.status_changes.clone()
    }

    pub fn parent(&self) -> Option<Control> {
        read_lock(&self.node.parent, "reading parent")
            .upgrade()
            .map(|node| Control { node })
    }

    pub fn root(&self) -> Control {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Direct children in insertion order. Empty for leaves.
    pub fn controls(&self) -> Vec<Control> {
        match &*read_lock(&self.node.children, "listing children") {
            Children::Leaf => Vec::new(),
            Children::Group(entries) => entries.iter().map(|(_, child)| child.clone()).collect(),
            Children::Array(items) => items.clone(),
        }
    }

    pub fn child_names(&self) -> Vec<String> {
        match &*read_lock(&self.node.children, "listing child names") {
            Children::Group(entries) => entries.iter().map(|(name, _)| name.clone()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &*read_lock(&self.node.children, "counting children") {
            Children::Leaf => 0,
            Children::Group(entries) => entries.len(),
            Children::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `path` relative to this control. The empty path yields the
    /// control itself; any segment that does not resolve yields `None`.
    pub fn find(&self, path: impl Into<ControlPath>) -> Option<Control> {
        path.into()
            .segments()
            .iter()
            .try_fold(self.clone(), |current, segment| current.child(segment))
    }

    fn child(&self, segment: &PathSegment) -> Option<Control> {
        match &*read_lock(&self.node.children, "resolving path segment") {
            Children::Leaf => None,
            Children::Group(entries) => {
                let key = segment.as_key();
                entries
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, child)| child.clone())
            }
            Children::Array(items) => segment
                .as_index()
                .and_then(|index| items.get(index))
                .cloned(),
        }
    }

    pub fn has_error(&self, code: &str) -> bool {
        self.get_error(code).is_some()
    }

    pub fn has_error_at(&self, code: &str, path: impl Into<ControlPath>) -> bool {
        self.get_error_at(code, path).is_some()
    }

    pub fn get_error(&self, code: &str) -> Option<Value> {
        self.read_state()
            .errors
            .as_ref()
            .and_then(|errors| errors.get(code).cloned())
    }

    pub fn get_error_at(&self, code: &str, path: impl Into<ControlPath>) -> Option<Value> {
        self.find(path)?.get_error(code)
    }

    /// Writes a value programmatically. Composite controls require a value of
    /// matching shape that names every child and no unknown ones.
    pub fn set_value(&self, value: impl Into<Value>, opts: UpdateOptions) -> FormResult<()> {
        let value = value.into();
        let child_opts = UpdateOptions {
            only_self: true,
            ..opts
        };
        match self.node.kind {
            ControlKind::Leaf => {
                self.write_state().value = value;
            }
            ControlKind::Group => {
                let mut values = match value {
                    Value::Object(values) => values,
                    other => return Err(value_shape(ControlKind::Group, &other)),
                };
                let names = self.child_names();
                if let Some(unknown) = values.keys().find(|key| !names.contains(key)) {
                    return Err(FormError::MissingControl(unknown.clone()));
                }
                if let Some(missing) = names.iter().find(|name| !values.contains_key(*name)) {
                    return Err(FormError::MissingValue(missing.clone()));
                }
                for (name, child) in names.iter().zip(self.controls()) {
                    if let Some(child_value) = values.remove(name) {
                        child.set_value(child_value, child_opts)?;
                    }
                }
            }
            ControlKind::Array => {
                let values = match value {
                    Value::Array(values) => values,
                    other => return Err(value_shape(ControlKind::Array, &other)),
                };
                let children = self.controls();
                if values.len() > children.len() {
                    return Err(FormError::IndexOutOfRange {
                        index: children.len(),
                        len: children.len(),
                    });
                }
                if values.len() < children.len() {
                    return Err(FormError::MissingValue(values.len().to_string()));
                }
                for (child, child_value) in children.iter().zip(values) {
                    child.set_value(child_value, child_opts)?;
                }
            }
        }
        self.update_value_and_validity(opts);
        Ok(())
    }

    /// Lenient counterpart of [`Control::set_value`]: applies whatever parts
    /// of `value` match existing children and ignores the rest.
    pub fn patch_value(&self, value: impl Into<Value>, opts: UpdateOptions) {
        let value = value.into();
        let child_opts = UpdateOptions {
            only_self: true,
            ..opts
        };
        match (self.node.kind, value) {
            (ControlKind::Leaf, value) => {
                self.write_state().value = value;
            }
            (ControlKind::Group, Value::Object(mut values)) => {
                for (name, child) in self.child_names().iter().zip(self.controls()) {
                    if let Some(child_value) = values.remove(name) {
                        child.patch_value(child_value, child_opts);
                    }
                }
            }
            (ControlKind::Array, Value::Array(values)) => {
                for (child, child_value) in self.controls().iter().zip(values) {
                    child.patch_value(child_value, child_opts);
                }
            }
            (kind, other) => {
                trace!(%kind, value = %other, "ignoring patch with mismatched shape");
                return;
            }
        }
        self.update_value_and_validity(opts);
    }

    /// Restores the control to `value` (or its default when `None`), marks it
    /// pristine and untouched, and recomputes validation.
    pub fn reset(&self, value: Option<Value>, opts: UpdateOptions) {
        let child_opts = UpdateOptions {
            only_self: true,
            ..opts
        };
        match self.node.kind {
            ControlKind::Leaf => {
                {
                    let mut state = self.write_state();
                    let fallback = state.default_value.clone();
                    state.value = value.unwrap_or(fallback);
                }
                self.mark_as_pristine(opts);
                self.mark_as_untouched(opts);
            }
            ControlKind::Group => {
                let mut values = match value {
                    Some(Value::Object(values)) => values,
                    _ => Map::new(),
                };
                for (name, child) in self.child_names().iter().zip(self.controls()) {
                    child.reset(values.remove(name), child_opts);
                }
                self.update_pristine(opts);
                self.update_touched(opts);
            }
            ControlKind::Array => {
                let mut values = match value {
                    Some(Value::Array(values)) => values.into_iter().map(Some).collect(),
                    _ => Vec::new(),
                };
                for (index, child) in self.controls().iter().enumerate() {
                    child.reset(values.get_mut(index).and_then(Option::take), child_opts);
                }
                self.update_pristine(opts);
                self.update_touched(opts);
            }
        }
        debug!(kind = %self.node.kind, "control reset");
        self.update_value_and_validity(opts);
    }

    /// Recomputes the aggregate value, reruns validation, emits on both
    /// streams and then repeats on each ancestor unless `only_self` is set.
    pub fn update_value_and_validity(&self, opts: UpdateOptions) {
        let initial = if self.all_controls_disabled() {
            ControlStatus::Disabled
        } else {
            ControlStatus::Valid
        };
        self.write_state().status = initial;
        self.update_value();
        self.cancel_pending_validation();

        if initial == ControlStatus::Disabled {
            self.write_state().errors = None;
        } else {
            let errors = normalize_errors(
                self.node
                    .validator
                    .as_ref()
                    .and_then(|validator| validator.validate(self)),
            );
            let status = self.calculate_status(errors.is_some(), false);
            {
                let mut state = self.write_state();
                state.errors = errors;
                state.status = status;
            }
            if matches!(status, ControlStatus::Valid | ControlStatus::Pending) {
                self.start_async_validation(opts.emit_event);
            }
        }

        if opts.emit_event {
            self.node.value_changes.emit(self.value());
            self.node.status_changes.emit(self.status());
        }

        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_value_and_validity(opts);
        }
    }

    /// Overrides the control's own errors without running validators.
    /// Ignored while the control is disabled.
    pub fn set_errors(&self, errors: Option<ValidationErrors>, opts: UpdateOptions) {
        let errors = if self.disabled() {
            None
        } else {
            normalize_errors(errors)
        };
        self.write_state().errors = errors;
        self.update_controls_errors(opts);
    }

    pub fn mark_as_touched(&self, opts: UpdateOptions) {
        self.write_state().touched = true;
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.mark_as_touched(opts);
        }
    }

    pub fn mark_all_as_touched(&self) {
        self.mark_as_touched(UpdateOptions::only_self());
        for child in self.controls() {
            child.mark_all_as_touched();
        }
    }

    pub fn mark_as_untouched(&self, opts: UpdateOptions) {
        self.write_state().touched = false;
        for child in self.controls() {
            child.mark_as_untouched(UpdateOptions::only_self());
        }
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_touched(opts);
        }
    }

    pub fn mark_as_dirty(&self, opts: UpdateOptions) {
        self.write_state().pristine = false;
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.mark_as_dirty(opts);
        }
    }

    pub fn mark_as_pristine(&self, opts: UpdateOptions) {
        self.write_state().pristine = true;
        for child in self.controls() {
            child.mark_as_pristine(UpdateOptions::only_self());
        }
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_pristine(opts);
        }
    }

    /// Disables the control and its descendants. A disabled control has no
    /// errors and is left out of its parent's aggregate value.
    pub fn disable(&self, opts: UpdateOptions) {
        self.cancel_pending_validation();
        {
            let mut state = self.write_state();
            state.status = ControlStatus::Disabled;
            state.errors = None;
        }
        for child in self.controls() {
            child.disable(UpdateOptions {
                only_self: true,
                ..opts
            });
        }
        self.update_value();
        if opts.emit_event {
            self.node.value_changes.emit(self.value());
            self.node.status_changes.emit(ControlStatus::Disabled);
        }
        self.update_ancestors(opts);
    }

    pub fn enable(&self, opts: UpdateOptions) {
        self.write_state().status = ControlStatus::Valid;
        for child in self.controls() {
            child.enable(UpdateOptions {
                only_self: true,
                ..opts
            });
        }
        self.update_value_and_validity(UpdateOptions {
            only_self: true,
            emit_event: opts.emit_event,
        });
        self.update_ancestors(opts);
    }

    pub fn add_control(&self, name: impl Into<String>, control: Control) -> FormResult<()> {
        let name = name.into();
        {
            let mut children = write_lock(&self.node.children, "adding group control");
            let Children::Group(entries) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Group));
            };
            if entries.iter().any(|(existing, _)| *existing == name) {
                return Err(FormError::DuplicateControl(name));
            }
            entries.push((name, control.clone()));
        }
        control.attach_to(self);
        self.update_value_and_validity(UpdateOptions::default());
        Ok(())
    }

    /// Replaces (or inserts) the child registered under `name`, returning the
    /// previous one.
    pub fn set_control(
        &self,
        name: impl Into<String>,
        control: Control,
    ) -> FormResult<Option<Control>> {
        let name = name.into();
        let previous = {
            let mut children = write_lock(&self.node.children, "replacing group control");
            let Children::Group(entries) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Group));
            };
            match entries.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => Some(std::mem::replace(&mut entry.1, control.clone())),
                None => {
                    entries.push((name, control.clone()));
                    None
                }
            }
        };
        if let Some(previous) = &previous {
            previous.detach();
        }
        control.attach_to(self);
        self.update_value_and_validity(UpdateOptions::default());
        Ok(previous)
    }

    pub fn remove_control(&self, name: &str) -> FormResult<Control> {
        let removed = {
            let mut children = write_lock(&self.node.children, "removing group control");
            let Children::Group(entries) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Group));
            };
            let Some(position) = entries.iter().position(|(existing, _)| existing == name) else {
                return Err(FormError::MissingControl(name.to_owned()));
            };
            entries.remove(position).1
        };
        removed.detach();
        self.update_value_and_validity(UpdateOptions::default());
        Ok(removed)
    }

    pub fn push(&self, control: Control) -> FormResult<()> {
        let len = self.len();
        self.insert(len, control)
    }

    pub fn insert(&self, index: usize, control: Control) -> FormResult<()> {
        {
            let mut children = write_lock(&self.node.children, "inserting array control");
            let Children::Array(items) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Array));
            };
            if index > items.len() {
                return Err(FormError::IndexOutOfRange {
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, control.clone());
        }
        control.attach_to(self);
        self.update_value_and_validity(UpdateOptions::default());
        Ok(())
    }

    pub fn remove_at(&self, index: usize) -> FormResult<Control> {
        let removed = {
            let mut children = write_lock(&self.node.children, "removing array control");
            let Children::Array(items) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Array));
            };
            if index >= items.len() {
                return Err(FormError::IndexOutOfRange {
                    index,
                    len: items.len(),
                });
            }
            items.remove(index)
        };
        removed.detach();
        self.update_value_and_validity(UpdateOptions::default());
        Ok(removed)
    }

    pub fn clear(&self) -> FormResult<()> {
        let removed = {
            let mut children = write_lock(&self.node.children, "clearing array controls");
            let Children::Array(items) = &mut *children else {
                return Err(self.kind_mismatch(ControlKind::Array));
            };
            std::mem::take(items)
        };
        for child in &removed {
            child.detach();
        }
        self.update_value_and_validity(UpdateOptions::default());
        Ok(())
    }

    /// Drives outstanding async validation of this control and its
    /// descendants to completion. Results superseded by a newer validation
    /// run are dropped.
    ///
    /// Dropping the returned future before it completes hands the unfinished
    /// validation back to the control, so a later `settle` picks it up again.
    pub fn settle(&self) -> BoxFuture<'static, ()> {
        let control = self.clone();
        async move {
            for child in control.controls() {
                child.settle().await;
            }

            let pending = control.pending_lock().take();
            let Some(pending) = pending else {
                return;
            };
            let (ticket, emit_event) = (pending.ticket, pending.emit_event);
            let mut claim = PendingClaim {
                control: control.clone(),
                pending: Some(pending),
            };
            let debounce = control.node.options.async_debounce;
            if !debounce.is_zero() {
                Delay::new(debounce).await;
                if !control.is_latest_ticket(ticket) {
                    trace!(
                        ticket = ticket.0,
                        "async validation superseded during debounce"
                    );
                    claim.pending = None;
                    return;
                }
            }
            let result = match claim.pending.as_mut() {
                Some(pending) => (&mut pending.future).await,
                None => return,
            };
            claim.pending = None;
            control.finish_async_validation(ticket, result, emit_event);
        }
        .boxed()
    }

    pub fn validation_ticket(&self) -> ValidationTicket {
        self.read_state().ticket
    }

    fn attach_to(&self, parent: &Control) {
        *write_lock(&self.node.parent, "attaching parent") = Arc::downgrade(&parent.node);
    }

    fn detach(&self) {
        *write_lock(&self.node.parent, "detaching parent") = Weak::new();
    }

    fn kind_mismatch(&self, expected: ControlKind) -> FormError {
        FormError::KindMismatch {
            expected,
            found: self.node.kind,
        }
    }

    fn update_value(&self) {
        let include_disabled = self.disabled();
        let value = match &*read_lock(&self.node.children, "aggregating value") {
            Children::Leaf => return,
            Children::Group(entries) => Value::Object(
                entries
                    .iter()
                    .filter(|(_, child)| include_disabled || child.enabled())
                    .map(|(name, child)| (name.clone(), child.value()))
                    .collect(),
            ),
            Children::Array(items) => Value::Array(
                items
                    .iter()
                    .filter(|child| include_disabled || child.enabled())
                    .map(Control::value)
                    .collect(),
            ),
        };
        self.write_state().value = value;
    }

    fn all_controls_disabled(&self) -> bool {
        if self.node.kind == ControlKind::Leaf {
            return self.disabled();
        }
        let children = self.controls();
        if children.iter().any(Control::enabled) {
            return false;
        }
        !children.is_empty() || self.disabled()
    }

    fn any_child_has(&self, status: ControlStatus) -> bool {
        self.controls().iter().any(|child| child.status() == status)
    }

    fn calculate_status(&self, has_errors: bool, own_pending: bool) -> ControlStatus {
        if self.all_controls_disabled() {
            ControlStatus::Disabled
        } else if has_errors {
            ControlStatus::Invalid
        } else if own_pending || self.any_child_has(ControlStatus::Pending) {
            ControlStatus::Pending
        } else if self.any_child_has(ControlStatus::Invalid) {
            ControlStatus::Invalid
        } else {
            ControlStatus::Valid
        }
    }

    fn update_controls_errors(&self, opts: UpdateOptions) {
        let (has_errors, own_pending) = {
            let state = self.read_state();
            (state.errors.is_some(), state.async_in_flight)
        };
        let status = self.calculate_status(has_errors, own_pending);
        {
            let mut state = self.write_state();
            state.status = status;
            if status == ControlStatus::Disabled {
                state.errors = None;
            }
        }
        if opts.emit_event {
            self.node.status_changes.emit(status);
        }
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_controls_errors(opts);
        }
    }

    fn update_pristine(&self, opts: UpdateOptions) {
        if self.node.kind != ControlKind::Leaf {
            let pristine = !self.controls().iter().any(Control::dirty);
            self.write_state().pristine = pristine;
        }
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_pristine(opts);
        }
    }

    fn update_touched(&self, opts: UpdateOptions) {
        if self.node.kind != ControlKind::Leaf {
            let touched = self.controls().iter().any(Control::touched);
            self.write_state().touched = touched;
        }
        if let Some(parent) = self.parent().filter(|_| !opts.only_self) {
            parent.update_touched(opts);
        }
    }

    fn update_ancestors(&self, opts: UpdateOptions) {
        if opts.only_self {
            return;
        }
        if let Some(parent) = self.parent() {
            parent.update_value_and_validity(opts);
            parent.update_pristine(opts);
            parent.update_touched(opts);
        }
    }

    fn start_async_validation(&self, emit_event: bool) {
        let Some(validator) = self.node.async_validator.clone() else {
            return;
        };
        let ticket = {
            let mut state = self.write_state();
            state.ticket = state.ticket.next();
            state.status = ControlStatus::Pending;
            state.async_in_flight = true;
            state.ticket
        };
        trace!(ticket = ticket.0, "starting async validation");
        let future = validator.validate(self);
        *self.pending_lock() = Some(PendingValidation {
            ticket,
            emit_event,
            future,
        });
    }

    fn cancel_pending_validation(&self) {
        let cancelled = self.pending_lock().take();
        let mut state = self.write_state();
        if cancelled.is_some() || state.async_in_flight {
            state.ticket = state.ticket.next();
            state.async_in_flight = false;
        }
    }

    fn is_latest_ticket(&self, ticket: ValidationTicket) -> bool {
        self.read_state().ticket == ticket
    }

    fn finish_async_validation(
        &self,
        ticket: ValidationTicket,
        errors: Option<ValidationErrors>,
        emit_event: bool,
    ) {
        {
            let mut state = self.write_state();
            if state.ticket != ticket {
                trace!(
                    ticket = ticket.0,
                    latest = state.ticket.0,
                    "discarding stale async validation result"
                );
                return;
            }
            state.async_in_flight = false;
            state.errors = normalize_errors(errors);
        }
        debug!(ticket = ticket.0, "async validation finished");
        self.update_controls_errors(UpdateOptions {
            only_self: false,
            emit_event,
        });
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ControlState> {
        read_lock(&self.node.state, "reading control state")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ControlState> {
        write_lock(&self.node.state, "writing control state")
    }

    fn pending_lock(&self) -> MutexGuard<'_, Option<PendingValidation>> {
        match self.node.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("recovering poisoned lock while accessing pending validation");
                poisoned.into_inner()
            }
        }
    }
}

fn value_shape(kind: ControlKind, value: &Value) -> FormError {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    FormError::ValueShape { kind, found }
}

fn read_lock<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(context, "recovering poisoned control lock");
            poisoned.into_inner()
        }
    }
}

fn write_lock<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(context, "recovering poisoned control lock");
            poisoned.into_inner()
        }
    }
}
