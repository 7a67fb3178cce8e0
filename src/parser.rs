mod path;

use nom::combinator::all_consuming;
use nom::Parser;

use crate::error::{Result, RuntimeError};
use crate::format::{ListItem, Path};

pub use self::path::{list_item_name, path, path_component};

/// parse a dotted path string such as `knot.stitch.0` or `.^.c-0`
pub fn parse_path(input: &str) -> Result<Path> {
    if input.is_empty() {
        return Ok(Path::default());
    }

    let (_, path) = all_consuming(path)
        .parse(input)
        .map_err(|e| RuntimeError::PathParse(format!("'{}': {}", input, e)))?;

    Ok(path)
}

/// parse a qualified list item key such as `Colours.red`
pub fn parse_list_item(input: &str) -> Result<ListItem> {
    let (_, (origin, item)) = all_consuming(list_item_name)
        .parse(input)
        .map_err(|e| RuntimeError::bytecode(format!("invalid list item '{}': {}", input, e)))?;

    Ok(ListItem::new(origin, item))
}
