use std::collections::BTreeMap;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Value, json};

use super::control::{Control, FormError, FormResult};

/// Error code mapped to an arbitrary detail payload, e.g.
/// `{"minlength": {"requiredLength": 3, "actualLength": 1}}`.
pub type ValidationErrors = BTreeMap<String, Value>;

pub type BoxedValidationFuture = BoxFuture<'static, Option<ValidationErrors>>;

pub trait Validator: Send + Sync {
    fn validate(&self, control: &Control) -> Option<ValidationErrors>;
}

impl<F> Validator for F
where
    F: Fn(&Control) -> Option<ValidationErrors> + Send + Sync,
{
    fn validate(&self, control: &Control) -> Option<ValidationErrors> {
        (self)(control)
    }
}

/// Validator whose verdict arrives later. While its future is outstanding the
/// control reports `Pending`; see [`Control::settle`].
pub trait AsyncValidator: Send + Sync {
    fn validate(&self, control: &Control) -> BoxedValidationFuture;
}

impl<F> AsyncValidator for F
where
    F: Fn(&Control) -> BoxedValidationFuture + Send + Sync,
{
    fn validate(&self, control: &Control) -> BoxedValidationFuture {
        (self)(control)
    }
}

/// Single-entry error map.
pub fn validation_error(code: impl Into<String>, detail: impl Into<Value>) -> ValidationErrors {
    ValidationErrors::from([(code.into(), detail.into())])
}

pub(super) fn normalize_errors(errors: Option<ValidationErrors>) -> Option<ValidationErrors> {
    errors.filter(|errors| !errors.is_empty())
}

fn is_empty_input(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn input_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => Some(text.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn input_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub fn required() -> impl Validator {
    |control: &Control| {
        is_empty_input(&control.value()).then(|| validation_error("required", true))
    }
}

/// Requires the value to be exactly `true`, for consent checkboxes.
pub fn required_true() -> impl Validator {
    |control: &Control| {
        (control.value() != Value::Bool(true)).then(|| validation_error("required", true))
    }
}

pub fn min_length(min: usize) -> impl Validator {
    move |control: &Control| {
        let value = control.value();
        if is_empty_input(&value) {
            return None;
        }
        let actual = input_length(&value)?;
        (actual < min).then(|| {
            validation_error(
                "minlength",
                json!({ "requiredLength": min, "actualLength": actual }),
            )
        })
    }
}

pub fn max_length(max: usize) -> impl Validator {
    move |control: &Control| {
        let actual = input_length(&control.value())?;
        (actual > max).then(|| {
            validation_error(
                "maxlength",
                json!({ "requiredLength": max, "actualLength": actual }),
            )
        })
    }
}

pub fn min(min: f64) -> impl Validator {
    move |control: &Control| {
        let value = control.value();
        if is_empty_input(&value) {
            return None;
        }
        let actual = input_number(&value)?;
        (actual < min).then(|| validation_error("min", json!({ "min": min, "actual": actual })))
    }
}

pub fn max(max: f64) -> impl Validator {
    move |control: &Control| {
        let value = control.value();
        if is_empty_input(&value) {
            return None;
        }
        let actual = input_number(&value)?;
        (actual > max).then(|| validation_error("max", json!({ "max": max, "actual": actual })))
    }
}

/// Matches string values against `pattern`, anchored at both ends unless the
/// pattern already is. Empty values pass; pair with [`required`] for that.
pub fn pattern(pattern: &str) -> FormResult<impl Validator + use<>> {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    let regex =
        Regex::new(&anchored).map_err(|error| FormError::InvalidPattern(error.to_string()))?;

    Ok(move |control: &Control| {
        let value = control.value();
        if is_empty_input(&value) {
            return None;
        }
        let actual = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        (!regex.is_match(&actual)).then(|| {
            validation_error(
                "pattern",
                json!({ "requiredPattern": regex.as_str(), "actualValue": actual }),
            )
        })
    })
}

static EMAIL_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-zA-Z0-9!#$%&'*+/=?^_`{|}~-]+)*@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .ok()
});

const EMAIL_MAX_LENGTH: usize = 254;
const EMAIL_LOCAL_MAX_LENGTH: usize = 64;

pub fn email() -> impl Validator {
    |control: &Control| {
        let value = control.value();
        if is_empty_input(&value) {
            return None;
        }
        let Value::String(text) = value else {
            return Some(validation_error("email", true));
        };
        let local_fits = text
            .split_once('@')
            .is_some_and(|(local, _)| local.len() <= EMAIL_LOCAL_MAX_LENGTH);
        let matches = EMAIL_PATTERN
            .as_ref()
            .is_some_and(|regex| regex.is_match(&text));
        (text.len() > EMAIL_MAX_LENGTH || !local_fits || !matches)
            .then(|| validation_error("email", true))
    }
}
