mod binding;
mod control;
mod path;
mod stream;
pub mod validation;


pub use binding::{
    ArrayBinding, ControlBinding, ControlNameBinding, GroupBinding, StandaloneBinding,
};
pub use control::{
    Control, ControlBuilder, ControlKind, ControlOptions, ControlStatus, FormError, FormResult,
    UpdateOn, UpdateOptions, ValidationTicket, WeakControl,
};
pub use path::{ControlPath, PathSegment};
pub use stream::{ChangeStream, Subscription};
pub use validation::{
    AsyncValidator, BoxedValidationFuture, ValidationErrors, Validator, validation_error,
};
