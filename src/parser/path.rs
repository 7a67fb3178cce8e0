use nom::branch::alt;
use nom::bytes::complete::*;
use nom::character::complete::*;
use nom::combinator::*;
use nom::multi::*;
use nom::sequence::*;
use nom::Parser;

use crate::format::{Component, Path};
use crate::result::ParseResult;

fn segment_end(input: &str) -> ParseResult<&str, ()> {
    peek(alt((value((), char('.')), value((), eof)))).parse(input)
}

pub fn path_component(input: &str) -> ParseResult<&str, Component> {
    alt((
        map(terminated(tag("^"), segment_end), |_| Component::Parent),
        map_res(terminated(digit1, segment_end), |digits: &str| {
            digits.parse::<usize>().map(Component::Index)
        }),
        map(take_while(|c| c != '.'), |name: &str| {
            Component::Name(name.to_string())
        }),
    ))
    .parse(input)
}

pub fn path(input: &str) -> ParseResult<&str, Path> {
    map(
        pair(opt(char('.')), separated_list1(char('.'), path_component)),
        |(relative, components)| Path::new(components, relative.is_some()),
    )
    .parse(input)
}

pub fn list_item_name(input: &str) -> ParseResult<&str, (&str, &str)> {
    separated_pair(take_while(|c| c != '.'), char('.'), rest).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("^"), Ok(("", Component::Parent)));
        assert_eq!(path_component("12.x"), Ok((".x", Component::Index(12))));
        assert_eq!(
            path_component("c-0"),
            Ok(("", Component::Name("c-0".to_string())))
        );
        // digits followed by other characters are a name
        assert_eq!(
            path_component("0a"),
            Ok(("", Component::Name("0a".to_string())))
        );
        assert_eq!(
            path_component("^x"),
            Ok(("", Component::Name("^x".to_string())))
        );
    }

    #[test]
    fn test_path() {
        let (rest, p) = path("knot.stitch.0").unwrap();
        assert_eq!(rest, "");
        assert!(!p.is_relative());
        assert_eq!(
            p.components(),
            &[
                Component::Name("knot".to_string()),
                Component::Name("stitch".to_string()),
                Component::Index(0),
            ]
        );

        let (_, p) = path(".^.c-0").unwrap();
        assert!(p.is_relative());
        assert_eq!(
            p.components(),
            &[Component::Parent, Component::Name("c-0".to_string())]
        );
    }

    #[test]
    fn test_list_item_name() {
        assert_eq!(list_item_name("Colours.red"), Ok(("", ("Colours", "red"))));
        assert!(list_item_name("nodot").is_err());
    }
}
