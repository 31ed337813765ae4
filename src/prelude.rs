pub use crate::form::validation;
pub use crate::form::{
    ArrayBinding, Control, ControlBinding, ControlBuilder, ControlNameBinding, ControlPath,
    ControlStatus, GroupBinding, StandaloneBinding, UpdateOn, UpdateOptions, ValidationErrors,
    validation_error,
};
