use std::sync::{Arc, Mutex};

use skein::error::RuntimeError;
use skein::format::*;
use skein::runtime::{ErrorType, Story};

const HELLO: &str = r##"{"inkVersion":21,"root":[["^Hello, world!","\n",["done",{"#f":5,"#n":"g-0"}],null],"done",{"#f":1}],"listDefs":{}}"##;

const GLUE: &str = r##"{"inkVersion":21,"root":[["^Hello","\n","<>","^ world","\n","done",null],"done",null]}"##;

const GLUE_MID_LINE: &str = r##"{"inkVersion":21,"root":[["^Hello ","^world","<>","^!","done",null],"done",null]}"##;

const CHOICES: &str = r##"{"inkVersion":21,"root":[[
    "^Hello","\n",
    "ev","str","^A","/str","/ev",{"*":"0.c-0","flg":20},
    "ev","str","^B","/str","/ev",{"*":"0.c-1","flg":20},
    {"c-0":["^You chose A.","\n",{"->":"0.g-0"},{"#f":5}],
     "c-1":["^You chose B.","\n",{"->":"0.g-0"},{"#f":5}],
     "g-0":["end",null]}
],"done",{"#f":1}]}"##;

const ONCE_ONLY: &str = r##"{"inkVersion":21,"root":[[
    "ev","str","^A","/str","/ev",{"*":"0.c-0","flg":20},
    "ev","str","^B","/str","/ev",{"*":"0.c-1","flg":20},
    {"c-0":["^Picked A","\n",{"->":"0"},{"#f":5}],
     "c-1":["^Picked B","\n","end",{"#f":5}]}
],"done",{"#f":1}]}"##;

const TUNNEL: &str = r##"{"inkVersion":21,"root":[
    ["^A","\n",{"->t->":"tun"},"^C","\n","done",null],
    "done",
    {"tun":["^B","\n","ev","void","/ev","->->",{"#f":1}]}
]}"##;

const TUNNEL_REDIRECT: &str = r##"{"inkVersion":21,"root":[
    ["^A","\n",{"->t->":"tun"},"^Skipped","\n","done",null],
    "done",
    {"tun":["^B","\n","ev",{"^->":"landing"},"/ev","->->",null],
     "landing":["^Landed","\n","done",null]}
]}"##;

const TUNNEL_WITHOUT_RETURN: &str = r##"{"inkVersion":21,"root":[
    ["^A","\n",{"->t->":"tun"},"^C","\n","done",null],
    "done",
    {"tun":["^B","\n",null]}
]}"##;

const LOOKAHEAD_INTO_KNOT: &str = r##"{"inkVersion":21,"root":[
    ["^A","\n",{"->":"k"},null],
    "done",
    {"k":["^B","\n","done",{"#f":1}]}
]}"##;

const FUNCTIONS: &str = r##"{"inkVersion":21,"root":[
    ["^Total: ","ev",2,3,{"f()":"add"},"out","/ev","\n","done",null],
    "done",
    {"add":[{"temp=":"b"},{"temp=":"a"},"ev",{"VAR?":"a"},{"VAR?":"b"},"+","/ev","~ret",null],
     "greet":["^Hi there","\n","ev",7,"/ev","~ret",null]}
]}"##;

const OUT_OF_CONTENT: &str = r##"{"inkVersion":21,"root":[["^Hi","\n",null],null]}"##;

const KNOTS: &str = r##"{"inkVersion":21,"root":[
    ["#","^title: demo","/#","^Start","\n","done",null],
    "done",
    {"knot":["#","^knot tag","/#","^In knot","\n","done",{"#f":1}]}
]}"##;

fn random_story(min: i32, max: i32) -> String {
    format!(
        r##"{{"inkVersion":21,"root":[["ev",{},{},"rnd","out","/ev","\n","done",null],"done",null]}}"##,
        min, max
    )
}

#[test]
fn hello_world() {
    let mut story = Story::new(HELLO).unwrap();
    assert!(story.can_continue());
    assert_eq!(story.continue_story().unwrap(), "Hello, world!\n");
    assert!(!story.can_continue());
    assert!(story.current_choices().is_empty());
    assert!(!story.has_error());
}

#[test]
fn glue_pulls_the_next_line_in() {
    let mut story = Story::new(GLUE).unwrap();
    assert_eq!(story.continue_maximally().unwrap(), "Hello world\n");
}

#[test]
fn glue_inside_a_line_is_dropped() {
    let mut story = Story::new(GLUE_MID_LINE).unwrap();
    assert_eq!(story.continue_story().unwrap(), "Hello world!");
    assert!(!story.can_continue());
}

#[test]
fn choosing_follows_the_choice() {
    let mut story = Story::new(CHOICES).unwrap();
    assert_eq!(story.continue_story().unwrap(), "Hello\n");
    assert!(!story.can_continue());

    let texts: Vec<_> = story.current_choices().iter().map(|c| c.text.clone()).collect();
    assert_eq!(texts, vec!["A", "B"]);
    assert_eq!(story.current_choices()[1].index, 1);

    let made = Arc::new(Mutex::new(Vec::new()));
    let sink = made.clone();
    story.set_on_make_choice(move |choice| sink.lock().unwrap().push(choice.text.clone()));

    story.choose_choice_index(1).unwrap();
    assert_eq!(story.continue_story().unwrap(), "You chose B.\n");
    assert!(!story.can_continue());
    assert_eq!(*made.lock().unwrap(), vec!["B".to_string()]);

    assert!(story.choose_choice_index(0).is_err());
}

#[test]
fn once_only_choices_disappear() {
    let mut story = Story::new(ONCE_ONLY).unwrap();
    assert_eq!(story.continue_maximally().unwrap(), "");
    assert_eq!(story.current_choices().len(), 2);

    story.choose_choice_index(0).unwrap();
    assert_eq!(story.continue_maximally().unwrap(), "Picked A\n");

    let choices = story.current_choices();
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].text, "B");
    assert_eq!(choices[0].index, 0);

    story.choose_choice_index(0).unwrap();
    assert_eq!(story.continue_maximally().unwrap(), "Picked B\n");
    assert!(story.current_choices().is_empty());
}

#[test]
fn tunnels_return_to_the_caller() {
    let mut story = Story::new(TUNNEL).unwrap();
    assert_eq!(story.continue_story().unwrap(), "A\n");
    assert_eq!(story.continue_story().unwrap(), "B\n");
    assert_eq!(story.continue_story().unwrap(), "C\n");
    assert!(!story.can_continue());
    assert_eq!(story.state().visit_count_at_path_string("tun").unwrap(), 1);
}

#[test]
fn tunnel_return_can_be_redirected() {
    let mut story = Story::new(TUNNEL_REDIRECT).unwrap();
    assert_eq!(story.continue_story().unwrap(), "A\n");
    assert_eq!(story.continue_story().unwrap(), "B\n");
    assert_eq!(story.continue_story().unwrap(), "Landed\n");
    assert!(!story.can_continue());
    assert!(!story.has_error());
}

#[test]
fn tunnel_without_return_is_reported() {
    let mut story = Story::new(TUNNEL_WITHOUT_RETURN).unwrap();
    assert_eq!(story.continue_story().unwrap(), "A\n");
    match story.continue_story() {
        Err(RuntimeError::Unhandled(message)) => {
            assert!(message.contains("Do you need a '->->' to return from a tunnel?"))
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn lookahead_does_not_count_visits() {
    let mut story = Story::new(LOOKAHEAD_INTO_KNOT).unwrap();
    assert_eq!(story.continue_story().unwrap(), "A\n");
    assert_eq!(story.state().visit_count_at_path_string("k").unwrap(), 0);

    assert_eq!(story.continue_story().unwrap(), "B\n");
    assert_eq!(story.state().visit_count_at_path_string("k").unwrap(), 1);
}

#[test]
fn functions() {
    let mut story = Story::new(FUNCTIONS).unwrap();
    assert_eq!(story.continue_story().unwrap(), "Total: 5\n");

    assert!(story.has_function("add"));
    assert!(!story.has_function("nope"));

    let result = story
        .evaluate_function("add", &[Value::Int(4), Value::Int(6)])
        .unwrap();
    assert_eq!(result.value, Some(Value::Int(10)));
    assert_eq!(result.text, "");

    let result = story.evaluate_function("greet", &[]).unwrap();
    assert_eq!(result.value, Some(Value::Int(7)));
    assert_eq!(result.text, "Hi there\n");

    assert!(matches!(
        story.evaluate_function("nope", &[]),
        Err(RuntimeError::InvalidOperation(_))
    ));
    assert!(matches!(
        story.evaluate_function("  ", &[]),
        Err(RuntimeError::InvalidOperation(_))
    ));
}

#[test]
fn running_out_of_content_is_reported() {
    let mut story = Story::new(OUT_OF_CONTENT).unwrap();
    match story.continue_story() {
        Err(RuntimeError::Unhandled(message)) => {
            assert!(message.starts_with("Ink had 1 error"));
            assert!(message.contains("ran out of content"));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let mut story = Story::new(OUT_OF_CONTENT).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    story.set_error_handler(move |message, kind| {
        sink.lock().unwrap().push((message.to_string(), kind));
    });

    assert_eq!(story.continue_story().unwrap(), "Hi\n");
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, ErrorType::Error);
    assert!(seen[0].0.starts_with("RUNTIME ERROR"));
    assert!(!story.can_continue());
}

#[test]
fn random() {
    let mut story = Story::new(&random_story(1, 1)).unwrap();
    assert_eq!(story.continue_story().unwrap(), "1\n");

    let mut story = Story::new(&random_story(5, 1)).unwrap();
    story.set_error_handler(|_, _| {});
    story.continue_story().unwrap();
    assert_eq!(story.state().previous_random(), 0);

    let mut story = Story::new(&random_story(5, 1)).unwrap();
    assert!(story.continue_story().is_err());
    let errors = story.current_errors();
    assert!(errors[0].starts_with("RUNTIME ERROR: (Ink Pointer -> 0 -- index 3)"));
    assert!(errors[0].contains("The maximum must be larger"));
}

#[test]
fn seeded_random_is_deterministic() {
    let run = |seed: i32| {
        let mut story = Story::new(&random_story(1, 100)).unwrap();
        story.state_mut().set_story_seed(seed);
        let text = story.continue_story().unwrap();
        (text, story.save())
    };

    let (first, saved) = run(7);
    assert_eq!((first.clone(), saved), run(7));

    let rolled: i32 = first.trim().parse().unwrap();
    assert!((1..=100).contains(&rolled));
}

#[test]
fn tags() {
    let mut story = Story::new(KNOTS).unwrap();
    assert_eq!(story.global_tags().unwrap(), vec!["title: demo"]);
    assert_eq!(
        story.tags_for_content_at_path("knot").unwrap(),
        vec!["knot tag"]
    );

    assert_eq!(story.continue_story().unwrap(), "Start\n");
    assert_eq!(story.current_tags().unwrap(), ["title: demo".to_string()]);
}

#[test]
fn choose_path_string_jumps() {
    let mut story = Story::new(KNOTS).unwrap();
    story.choose_path_string("knot", true, &[]).unwrap();
    assert_eq!(story.continue_story().unwrap(), "In knot\n");
    assert_eq!(story.current_tags().unwrap(), ["knot tag".to_string()]);
    assert_eq!(story.state().visit_count_at_path_string("knot").unwrap(), 1);

    assert!(story.choose_path_string("missing", true, &[]).is_err());
}

#[test]
fn reloading_written_bytecode() {
    let story = Story::new(CHOICES).unwrap();
    let mut reloaded = Story::new(&story.to_json_string()).unwrap();
    assert_eq!(reloaded.continue_story().unwrap(), "Hello\n");
    assert_eq!(reloaded.current_choices().len(), 2);
}
