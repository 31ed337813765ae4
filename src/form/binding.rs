use serde_json::Value;
use tracing::debug;

use super::control::{Control, ControlStatus, UpdateOn, UpdateOptions, WeakControl};
use super::path::ControlPath;
use super::stream::ChangeStream;
use super::validation::ValidationErrors;

/// Read/action surface a view element uses to observe the control it is
/// bound to.
///
/// Every accessor forwards to [`ControlBinding::control`] and returns `None`
/// (or `false`, or does nothing) while no control is bound, so callers never
/// need to check the binding state first.
pub trait ControlBinding {
    /// The bound control, if any. Implementations must not keep the control
    /// alive on their own.
    fn control(&self) -> Option<Control>;

    /// Position of the bound control in its tree, as a sequence of segment
    /// names from the root. `None` where a position is not meaningful.
    fn path(&self) -> Option<Vec<String>> {
        None
    }

    fn is_bound(&self) -> bool {
        self.control().is_some()
    }

    fn value(&self) -> Option<Value> {
        self.control().map(|control| control.value())
    }

    fn status(&self) -> Option<ControlStatus> {
        self.control().map(|control| control.status())
    }

    fn valid(&self) -> Option<bool> {
        self.control().map(|control| control.valid())
    }

    fn invalid(&self) -> Option<bool> {
        self.control().map(|control| control.invalid())
    }

    fn pending(&self) -> Option<bool> {
        self.control().map(|control| control.pending())
    }

    fn disabled(&self) -> Option<bool> {
        self.control().map(|control| control.disabled())
    }

    fn enabled(&self) -> Option<bool> {
        self.control().map(|control| control.enabled())
    }

    fn errors(&self) -> Option<ValidationErrors> {
        self.control().and_then(|control| control.errors())
    }

    fn pristine(&self) -> Option<bool> {
        self.control().map(|control| control.pristine())
    }

    fn dirty(&self) -> Option<bool> {
        self.control().map(|control| control.dirty())
    }

    fn touched(&self) -> Option<bool> {
        self.control().map(|control| control.touched())
    }

    fn untouched(&self) -> Option<bool> {
        self.control().map(|control| control.untouched())
    }

    fn update_on(&self) -> Option<UpdateOn> {
        self.control().map(|control| control.update_on())
    }

    fn status_changes(&self) -> Option<ChangeStream<ControlStatus>> {
        self.control().map(|control| control.status_changes())
    }

    fn value_changes(&self) -> Option<ChangeStream<Value>> {
        self.control().map(|control| control.value_changes())
    }

    /// Resets the bound control to `value` (or its default). No-op while
    /// unbound.
    fn reset(&self, value: Option<Value>) {
        if let Some(control) = self.control() {
            control.reset(value, UpdateOptions::default());
        }
    }

    fn has_error(&self, code: &str) -> bool {
        self.get_error(code).is_some()
    }

    /// Looks `code` up on the descendant at `path`, relative to the bound
    /// control. An unresolved segment reads as "no error".
    fn has_error_at(&self, code: &str, path: ControlPath) -> bool {
        self.get_error_at(code, path).is_some()
    }

    fn get_error(&self, code: &str) -> Option<Value> {
        self.get_error_at(code, ControlPath::empty())
    }

    fn get_error_at(&self, code: &str, path: ControlPath) -> Option<Value> {
        self.control()?.get_error_at(code, path)
    }
}

/// Weak slot holding the currently attached control.
#[derive(Clone, Debug, Default)]
struct BoundControl {
    control: Option<WeakControl>,
}

impl BoundControl {
    fn get(&self) -> Option<Control> {
        self.control.as_ref().and_then(WeakControl::upgrade)
    }

    fn bind(&mut self, control: &Control, path: Option<&[String]>) {
        debug!(path = ?path, kind = %control.kind(), "binding control");
        self.control = Some(control.downgrade());
    }

    fn unbind(&mut self, path: Option<&[String]>) {
        if self.control.take().is_some() {
            debug!(path = ?path, "unbinding control");
        }
    }
}

fn child_path(parent: &dyn ControlBinding, name: &str) -> Vec<String> {
    let mut path = parent.path().unwrap_or_default();
    path.push(name.to_owned());
    path
}

/// Binding for a control handed to the view directly, outside of any named
/// container. It has no position.
#[derive(Clone, Debug, Default)]
pub struct StandaloneBinding {
    slot: BoundControl,
}

impl StandaloneBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound_to(control: &Control) -> Self {
        let mut binding = Self::new();
        binding.bind(control);
        binding
    }

    pub fn bind(&mut self, control: &Control) {
        self.slot.bind(control, None);
    }

    pub fn unbind(&mut self) {
        self.slot.unbind(None);
    }
}

impl ControlBinding for StandaloneBinding {
    fn control(&self) -> Option<Control> {
        self.slot.get()
    }
}

/// Binding for a leaf registered by name inside a group or array binding.
#[derive(Clone, Debug)]
pub struct ControlNameBinding {
    name: String,
    path: Vec<String>,
    slot: BoundControl,
}

impl ControlNameBinding {
    pub fn new(name: impl Into<String>, parent: &dyn ControlBinding) -> Self {
        let name = name.into();
        Self {
            path: child_path(parent, &name),
            name,
            slot: BoundControl::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&mut self, control: &Control) {
        self.slot.bind(control, Some(self.path.as_slice()));
    }

    pub fn unbind(&mut self) {
        self.slot.unbind(Some(self.path.as_slice()));
    }
}

impl ControlBinding for ControlNameBinding {
    fn control(&self) -> Option<Control> {
        self.slot.get()
    }

    fn path(&self) -> Option<Vec<String>> {
        Some(self.path.clone())
    }
}

/// Binding for a group: either the root of a form (empty path) or a named
/// group nested inside another container.
#[derive(Clone, Debug)]
pub struct GroupBinding {
    name: Option<String>,
    path: Vec<String>,
    slot: BoundControl,
}

impl GroupBinding {
    pub fn root() -> Self {
        Self {
            name: None,
            path: Vec::new(),
            slot: BoundControl::default(),
        }
    }

    pub fn named(name: impl Into<String>, parent: &dyn ControlBinding) -> Self {
        let name = name.into();
        Self {
            path: child_path(parent, &name),
            name: Some(name),
            slot: BoundControl::default(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn bind(&mut self, control: &Control) {
        self.slot.bind(control, Some(self.path.as_slice()));
    }

    pub fn unbind(&mut self) {
        self.slot.unbind(Some(self.path.as_slice()));
    }
}

impl ControlBinding for GroupBinding {
    fn control(&self) -> Option<Control> {
        self.slot.get()
    }

    fn path(&self) -> Option<Vec<String>> {
        Some(self.path.clone())
    }
}

/// Binding for a repeated list of controls registered by name.
#[derive(Clone, Debug)]
pub struct ArrayBinding {
    name: String,
    path: Vec<String>,
    slot: BoundControl,
}

impl ArrayBinding {
    pub fn named(name: impl Into<String>, parent: &dyn ControlBinding) -> Self {
        let name = name.into();
        Self {
            path: child_path(parent, &name),
            name,
            slot: BoundControl::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&mut self, control: &Control) {
        self.slot.bind(control, Some(self.path.as_slice()));
    }

    pub fn unbind(&mut self) {
        self.slot.unbind(Some(self.path.as_slice()));
    }
}

impl ControlBinding for ArrayBinding {
    fn control(&self) -> Option<Control> {
        self.slot.get()
    }

    fn path(&self) -> Option<Vec<String>> {
        Some(self.path.clone())
    }
}
