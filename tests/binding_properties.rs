use calmform::form::{
    Control, ControlBinding, ControlBuilder, ControlPath, GroupBinding, StandaloneBinding,
    UpdateOptions, ValidationErrors, validation,
};
use proptest::prelude::*;
use serde_json::{Value, json};

#[derive(Clone, Debug)]
enum Step {
    Write(String),
    Disable,
    Enable,
    Touch,
    Reset,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-z]{0,4}".prop_map(Step::Write),
        Just(Step::Disable),
        Just(Step::Enable),
        Just(Step::Touch),
        Just(Step::Reset),
    ]
}

fn error_map() -> impl Strategy<Value = ValidationErrors> {
    prop::collection::btree_map("[a-z]{1,6}", any::<u8>().prop_map(Value::from), 0..4)
}

fn tree() -> Control {
    Control::group([
        ("name", Control::leaf("Ada")),
        (
            "address",
            Control::group([
                ("zip", Control::leaf("12345")),
                ("lines", Control::array([Control::leaf("a"), Control::leaf("b")])),
            ]),
        ),
    ])
}

const KNOWN_PATHS: [&str; 6] = [
    "",
    "name",
    "address",
    "address.zip",
    "address.lines.0",
    "address.lines.1",
];

proptest! {
    #[test]
    fn has_error_matches_error_map(errors in error_map(), code in "[a-z]{1,6}") {
        let control = Control::leaf("value");
        control.set_errors(Some(errors.clone()), UpdateOptions::default());
        let binding = StandaloneBinding::bound_to(&control);

        prop_assert_eq!(binding.has_error(&code), errors.contains_key(&code));
        prop_assert_eq!(binding.get_error(&code), errors.get(&code).cloned());
        prop_assert_eq!(binding.invalid(), Some(!errors.is_empty()));
        if !binding.has_error(&code) {
            prop_assert_eq!(binding.get_error(&code), None);
        }
    }

    #[test]
    fn path_lookup_matches_descendant_errors(
        target in prop::sample::select(KNOWN_PATHS.to_vec()),
        query in prop_oneof![
            prop::sample::select(KNOWN_PATHS.to_vec()).prop_map(str::to_owned),
            "[a-z]{1,5}(\\.[a-z0-9]{1,5}){0,2}",
        ],
        errors in error_map(),
        code in "[a-z]{1,6}",
    ) {
        let form = tree();
        let descendant = form.find(target).expect("known path resolves");
        descendant.set_errors(Some(errors), UpdateOptions::default());

        let mut binding = GroupBinding::root();
        binding.bind(&form);
        let path = ControlPath::parse(&query);
        let expected = form
            .find(path.clone())
            .and_then(|resolved| resolved.errors())
            .is_some_and(|errors| errors.contains_key(&code));

        prop_assert_eq!(binding.has_error_at(&code, path.clone()), expected);
        if !expected {
            prop_assert_eq!(binding.get_error_at(&code, path), None);
        }
    }

    #[test]
    fn status_flags_stay_exclusive(steps in prop::collection::vec(step(), 0..16)) {
        let control = ControlBuilder::leaf("seed")
            .validator(validation::min_length(2))
            .build();
        let binding = StandaloneBinding::bound_to(&control);

        for step in steps {
            match step {
                Step::Write(text) => control
                    .set_value(text, UpdateOptions::default())
                    .expect("leaf accepts any value"),
                Step::Disable => control.disable(UpdateOptions::default()),
                Step::Enable => control.enable(UpdateOptions::default()),
                Step::Touch => control.mark_as_touched(UpdateOptions::default()),
                Step::Reset => binding.reset(Some(json!("reset"))),
            }

            let flags = [
                binding.valid(),
                binding.invalid(),
                binding.pending(),
                binding.disabled(),
            ];
            prop_assert_eq!(flags.iter().filter(|flag| **flag == Some(true)).count(), 1);
            prop_assert_eq!(binding.enabled(), binding.disabled().map(|disabled| !disabled));
            prop_assert_eq!(binding.errors().is_some(), binding.invalid() == Some(true));
            prop_assert_ne!(binding.touched(), binding.untouched());
            prop_assert_ne!(binding.pristine(), binding.dirty());
        }
    }

    #[test]
    fn unbound_binding_never_reports_errors(code in "[a-z]{1,6}", query in "[a-z.]{0,12}") {
        let binding = StandaloneBinding::new();
        prop_assert!(!binding.has_error(&code));
        prop_assert!(!binding.has_error_at(&code, ControlPath::parse(&query)));
        prop_assert_eq!(binding.get_error_at(&code, ControlPath::parse(&query)), None);
        binding.reset(None);
        prop_assert_eq!(binding.value(), None);
    }
}
