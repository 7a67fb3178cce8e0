use std::sync::{Arc, Mutex};

use skein::error::RuntimeError;
use skein::format::*;
use skein::runtime::{Story, DEFAULT_FLOW_NAME};

const GLOBALS: &str = r##"{"inkVersion":21,"root":[
    ["ev",{"VAR?":"x"},"out","/ev","\n","ev",5,"/ev",{"VAR=":"x","re":true},"ev",{"VAR?":"x"},"out","/ev","\n","done",null],
    "done",
    {"global decl":["ev",1,{"VAR=":"x"},"/ev","end",null]}
]}"##;

const EXTERNAL: &str = r##"{"inkVersion":21,"root":[
    ["^Line one","\n","ev",{"x()":"beep"},"pop","/ev","^Line two","\n","done",null],
    "done",
    null
]}"##;

const EXTERNAL_WITH_FALLBACK: &str = r##"{"inkVersion":21,"root":[
    ["ev",4,{"x()":"double","exArgs":1},"out","/ev","\n","done",null],
    "done",
    {"double":[{"temp=":"n"},"ev",{"VAR?":"n"},2,"*","/ev","~ret",null]}
]}"##;

const CHOICES: &str = r##"{"inkVersion":21,"root":[[
    "^Hello","\n",
    "ev","str","^A","/str","/ev",{"*":"0.c-0","flg":20},
    "ev","str","^B","/str","/ev",{"*":"0.c-1","flg":20},
    {"c-0":["^You chose A.","\n",{"->":"0.g-0"},{"#f":5}],
     "c-1":["^You chose B.","\n",{"->":"0.g-0"},{"#f":5}],
     "g-0":["end",null]}
],"done",{"#f":1}]}"##;

const THREADED: &str = r##"{"inkVersion":21,"root":[
    ["thread",{"->":"opts"},"^Main","\n","done",null],
    "done",
    {"opts":["ev","str","^Side","/str","/ev",{"*":"opts.c-0","flg":20},"done",
        {"c-0":["^Took side","\n","end",{"#f":5}]}]}
]}"##;

const TWO_LINES: &str = r##"{"inkVersion":21,"root":[["^One","\n","^Two","\n","done",null],"done",null]}"##;

fn double(args: &[Value]) -> anyhow::Result<Option<Value>> {
    let n = args.first().and_then(Value::as_int).unwrap_or_default();
    Ok(Some(Value::Int(n * 2)))
}

#[test]
fn observers_see_finished_lines_only() {
    let mut story = Story::new(GLOBALS).unwrap();
    assert_eq!(story.variable("x"), Some(&Value::Int(1)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    story
        .observe_variable("x", move |name, value| {
            sink.lock().unwrap().push((name.to_string(), value.clone()));
        })
        .unwrap();

    assert_eq!(story.continue_story().unwrap(), "1\n");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(story.variable("x"), Some(&Value::Int(1)));

    assert_eq!(story.continue_story().unwrap(), "5\n");
    assert_eq!(*seen.lock().unwrap(), vec![("x".to_string(), Value::Int(5))]);

    story.set_variable("x", 10).unwrap();
    assert_eq!(story.variable("x"), Some(&Value::Int(10)));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn undeclared_variables() {
    let mut story = Story::new(GLOBALS).unwrap();
    assert!(matches!(
        story.set_variable("nope", 1),
        Err(RuntimeError::Story(_))
    ));
    assert!(story.observe_variable("nope", |_, _| {}).is_err());
    assert_eq!(story.variable("nope"), None);
}

#[test]
fn removed_observers_stay_quiet() {
    let mut story = Story::new(GLOBALS).unwrap();
    let calls = Arc::new(Mutex::new(0));
    let sink = calls.clone();
    let id = story
        .observe_variable("x", move |_, _| *sink.lock().unwrap() += 1)
        .unwrap();

    story.set_variable("x", 2).unwrap();
    story.remove_variable_observer(id).unwrap();
    story.set_variable("x", 3).unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn missing_external_fails_validation() {
    let mut story = Story::new(EXTERNAL).unwrap();
    match story.continue_story() {
        Err(RuntimeError::Story(message)) => {
            assert!(message.contains("Missing function binding for external: 'beep'"))
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn lookahead_unsafe_externals_wait_for_their_line() {
    let mut story = Story::new(EXTERNAL).unwrap();
    let calls = Arc::new(Mutex::new(0));
    let sink = calls.clone();
    story
        .bind_external_function(
            "beep",
            move |_: &[Value]| -> anyhow::Result<Option<Value>> {
                *sink.lock().unwrap() += 1;
                Ok(None)
            },
            false,
        )
        .unwrap();

    assert_eq!(story.continue_story().unwrap(), "Line one\n");
    assert_eq!(*calls.lock().unwrap(), 0);

    assert_eq!(story.continue_story().unwrap(), "Line two\n");
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn binding_twice_is_rejected() {
    let mut story = Story::new(EXTERNAL_WITH_FALLBACK).unwrap();
    story.bind_external_function("double", double, true).unwrap();
    assert!(story.bind_external_function("double", double, true).is_err());

    story.unbind_external_function("double").unwrap();
    assert!(story.unbind_external_function("double").is_err());
}

#[test]
fn externals_and_fallbacks() {
    let mut story = Story::new(EXTERNAL_WITH_FALLBACK).unwrap();
    story
        .bind_external_function(
            "double",
            |args: &[Value]| -> anyhow::Result<Option<Value>> {
                let n = args[0].as_int().unwrap_or_default();
                Ok(Some(Value::Int(n * 3)))
            },
            true,
        )
        .unwrap();
    assert_eq!(story.continue_story().unwrap(), "12\n");

    let mut story = Story::new(EXTERNAL_WITH_FALLBACK).unwrap();
    match story.continue_story() {
        Err(RuntimeError::Story(message)) => {
            assert!(message.contains("Missing function binding for external: 'double'"))
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let mut story = Story::new(EXTERNAL_WITH_FALLBACK).unwrap();
    story.set_allow_external_function_fallbacks(true);
    assert_eq!(story.continue_story().unwrap(), "8\n");
}

#[test]
fn failing_externals_surface_their_error() {
    let mut story = Story::new(EXTERNAL_WITH_FALLBACK).unwrap();
    story
        .bind_external_function(
            "double",
            |_: &[Value]| -> anyhow::Result<Option<Value>> { Err(anyhow::anyhow!("host failure")) },
            true,
        )
        .unwrap();
    assert!(matches!(
        story.continue_story(),
        Err(RuntimeError::External(_))
    ));
}

#[test]
fn save_and_restore() {
    let mut story = Story::new(CHOICES).unwrap();
    story.continue_story().unwrap();
    let saved = story.save();

    let mut restored = Story::new(CHOICES).unwrap();
    restored.restore(&saved).unwrap();
    assert!(!restored.can_continue());

    let texts: Vec<_> = restored.current_choices().iter().map(|c| c.text.clone()).collect();
    assert_eq!(texts, vec!["A", "B"]);

    story.choose_choice_index(0).unwrap();
    restored.choose_choice_index(0).unwrap();
    assert_eq!(story.continue_story().unwrap(), "You chose A.\n");
    assert_eq!(restored.continue_story().unwrap(), "You chose A.\n");
    assert_eq!(restored.state().current_turn_index(), 0);

    assert!(restored.restore("{}").is_err());
}

#[test]
fn threads_offer_choices_after_they_finish() {
    let mut story = Story::new(THREADED).unwrap();
    assert_eq!(story.continue_story().unwrap(), "Main\n");
    assert!(!story.can_continue());
    assert!(!story.has_error());
    assert_eq!(story.state().call_stack().threads().len(), 1);

    let texts: Vec<_> = story.current_choices().iter().map(|c| c.text.clone()).collect();
    assert_eq!(texts, vec!["Side"]);

    let saved = story.save();
    let mut restored = Story::new(THREADED).unwrap();
    restored.restore(&saved).unwrap();
    assert_eq!(restored.current_choices().len(), 1);

    story.choose_choice_index(0).unwrap();
    restored.choose_choice_index(0).unwrap();
    assert_eq!(story.continue_story().unwrap(), "Took side\n");
    assert_eq!(restored.continue_story().unwrap(), "Took side\n");
    assert!(!restored.has_error());
}

#[test]
fn flows_keep_separate_positions() {
    let mut story = Story::new(TWO_LINES).unwrap();
    assert_eq!(story.continue_story().unwrap(), "One\n");

    story.switch_flow("side").unwrap();
    assert_eq!(story.current_flow_name(), "side");
    assert!(!story.current_flow_is_default_flow());
    assert_eq!(story.continue_story().unwrap(), "One\n");

    story.switch_to_default_flow();
    assert!(story.current_flow_is_default_flow());
    assert_eq!(story.continue_story().unwrap(), "Two\n");

    assert_eq!(story.alive_flow_names(), vec!["side".to_string()]);
    assert!(story.remove_flow(DEFAULT_FLOW_NAME).is_err());
    story.remove_flow("side").unwrap();
    assert!(story.alive_flow_names().is_empty());
}

#[test]
fn background_save() {
    let mut story = Story::new(TWO_LINES).unwrap();
    let to_save = story.copy_state_for_background_thread_save().unwrap();
    assert!(story.copy_state_for_background_thread_save().is_err());

    assert_eq!(story.continue_story().unwrap(), "One\n");
    let saved = to_save.to_json_string();
    story.background_save_complete();

    let mut restored = Story::new(TWO_LINES).unwrap();
    restored.restore(&saved).unwrap();
    assert_eq!(restored.continue_story().unwrap(), "One\n");
    assert_eq!(story.continue_story().unwrap(), "Two\n");

    assert!(story.copy_state_for_background_thread_save().is_ok());
}

#[test]
fn reset_state_starts_over() {
    let mut story = Story::new(GLOBALS).unwrap();
    story.continue_maximally().unwrap();
    assert_eq!(story.variable("x"), Some(&Value::Int(5)));

    story.reset_state().unwrap();
    assert_eq!(story.variable("x"), Some(&Value::Int(1)));
    assert_eq!(story.continue_story().unwrap(), "1\n");
}
