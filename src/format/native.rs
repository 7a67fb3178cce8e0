use std::fmt;

use crate::error::{Result, RuntimeError};

use super::{InkList, ListDefinitions, Value, ValueType};

/// Built-in operators callable from bytecode by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFunction {
    Add,
    Subtract,
    Divide,
    Multiply,
    Mod,
    Negate,
    Equal,
    Greater,
    Less,
    GreaterThanOrEquals,
    LessThanOrEquals,
    NotEquals,
    Not,
    And,
    Or,
    Min,
    Max,
    Pow,
    Floor,
    Ceiling,
    Int,
    Float,
    Has,
    Hasnt,
    Intersect,
    ListMin,
    ListMax,
    All,
    Count,
    ValueOfList,
    Invert,
}

const NAMES: &[(NativeFunction, &str)] = &[
    (NativeFunction::Add, "+"),
    (NativeFunction::Subtract, "-"),
    (NativeFunction::Divide, "/"),
    (NativeFunction::Multiply, "*"),
    (NativeFunction::Mod, "%"),
    (NativeFunction::Negate, "_"),
    (NativeFunction::Equal, "=="),
    (NativeFunction::Greater, ">"),
    (NativeFunction::Less, "<"),
    (NativeFunction::GreaterThanOrEquals, ">="),
    (NativeFunction::LessThanOrEquals, "<="),
    (NativeFunction::NotEquals, "!="),
    (NativeFunction::Not, "!"),
    (NativeFunction::And, "&&"),
    (NativeFunction::Or, "||"),
    (NativeFunction::Min, "MIN"),
    (NativeFunction::Max, "MAX"),
    (NativeFunction::Pow, "POW"),
    (NativeFunction::Floor, "FLOOR"),
    (NativeFunction::Ceiling, "CEILING"),
    (NativeFunction::Int, "INT"),
    (NativeFunction::Float, "FLOAT"),
    (NativeFunction::Has, "?"),
    (NativeFunction::Hasnt, "!?"),
    (NativeFunction::Intersect, "^"),
    (NativeFunction::ListMin, "LIST_MIN"),
    (NativeFunction::ListMax, "LIST_MAX"),
    (NativeFunction::All, "LIST_ALL"),
    (NativeFunction::Count, "LIST_COUNT"),
    (NativeFunction::ValueOfList, "LIST_VALUE"),
    (NativeFunction::Invert, "LIST_INVERT"),
];

impl NativeFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        NAMES.iter().find(|(_, n)| *n == name).map(|(f, _)| *f)
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(f, _)| *f == self)
            .map(|(_, n)| *n)
            .unwrap_or_default()
    }

    pub fn arity(self) -> usize {
        use NativeFunction::*;
        match self {
            Negate | Not | Floor | Ceiling | Int | Float | ListMin | ListMax | All | Count
            | ValueOfList | Invert => 1,
            _ => 2,
        }
    }

    pub fn call(self, params: Vec<Value>, lists: &ListDefinitions) -> Result<Value> {
        if params.len() != self.arity() {
            return Err(RuntimeError::assertion(format!(
                "Unexpected number of parameters to {}",
                self
            )));
        }

        let has_list = params.iter().any(|p| matches!(p, Value::List(_)));
        if params.len() == 2 && has_list {
            return self.call_binary_list(&params[0], &params[1], lists);
        }

        let target = params
            .iter()
            .map(Value::value_type)
            .fold(ValueType::Int, Ord::max);
        let params = params
            .iter()
            .map(|p| p.cast(target))
            .collect::<Result<Vec<_>>>()?;

        match params.as_slice() {
            [Value::Int(x)] => self.int_unary(*x),
            [Value::Int(x), Value::Int(y)] => self.int_binary(*x, *y),
            [Value::Float(x)] => self.float_unary(*x),
            [Value::Float(x), Value::Float(y)] => self.float_binary(*x, *y),
            [Value::String(x), Value::String(y)] => self.string_binary(x, y),
            [Value::List(x)] => self.list_unary(x, lists),
            [Value::DivertTarget(x), Value::DivertTarget(y)] => match self {
                NativeFunction::Equal => Ok(Value::Bool(x == y)),
                NativeFunction::NotEquals => Ok(Value::Bool(x != y)),
                _ => Err(self.unsupported(target)),
            },
            _ => Err(self.unsupported(target)),
        }
    }

    fn unsupported(self, value_type: ValueType) -> RuntimeError {
        RuntimeError::story(format!(
            "Cannot perform operation {} on {:?}",
            self, value_type
        ))
    }

    fn int_unary(self, x: i32) -> Result<Value> {
        Ok(match self {
            NativeFunction::Negate => Value::Int(x.wrapping_neg()),
            NativeFunction::Not => Value::Bool(x == 0),
            NativeFunction::Floor | NativeFunction::Ceiling | NativeFunction::Int => Value::Int(x),
            NativeFunction::Float => Value::Float(x as f32),
            _ => return Err(self.unsupported(ValueType::Int)),
        })
    }

    fn int_binary(self, x: i32, y: i32) -> Result<Value> {
        Ok(match self {
            NativeFunction::Add => Value::Int(x.wrapping_add(y)),
            NativeFunction::Subtract => Value::Int(x.wrapping_sub(y)),
            NativeFunction::Multiply => Value::Int(x.wrapping_mul(y)),
            NativeFunction::Divide => Value::Int(
                x.checked_div(y)
                    .ok_or_else(|| RuntimeError::story("Division by zero"))?,
            ),
            NativeFunction::Mod => Value::Int(
                x.checked_rem(y)
                    .ok_or_else(|| RuntimeError::story("Modulo by zero"))?,
            ),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::Greater => Value::Bool(x > y),
            NativeFunction::Less => Value::Bool(x < y),
            NativeFunction::GreaterThanOrEquals => Value::Bool(x >= y),
            NativeFunction::LessThanOrEquals => Value::Bool(x <= y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::And => Value::Bool(x != 0 && y != 0),
            NativeFunction::Or => Value::Bool(x != 0 || y != 0),
            NativeFunction::Max => Value::Int(x.max(y)),
            NativeFunction::Min => Value::Int(x.min(y)),
            NativeFunction::Pow => Value::Float((x as f64).powf(y as f64) as f32),
            _ => return Err(self.unsupported(ValueType::Int)),
        })
    }

    fn float_unary(self, x: f32) -> Result<Value> {
        Ok(match self {
            NativeFunction::Negate => Value::Float(-x),
            NativeFunction::Not => Value::Bool(x == 0.0),
            NativeFunction::Floor => Value::Float(x.floor()),
            NativeFunction::Ceiling => Value::Float(x.ceil()),
            NativeFunction::Int => Value::Int(x as i32),
            NativeFunction::Float => Value::Float(x),
            _ => return Err(self.unsupported(ValueType::Float)),
        })
    }

    fn float_binary(self, x: f32, y: f32) -> Result<Value> {
        Ok(match self {
            NativeFunction::Add => Value::Float(x + y),
            NativeFunction::Subtract => Value::Float(x - y),
            NativeFunction::Multiply => Value::Float(x * y),
            NativeFunction::Divide => Value::Float(x / y),
            NativeFunction::Mod => Value::Float(x % y),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::Greater => Value::Bool(x > y),
            NativeFunction::Less => Value::Bool(x < y),
            NativeFunction::GreaterThanOrEquals => Value::Bool(x >= y),
            NativeFunction::LessThanOrEquals => Value::Bool(x <= y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::And => Value::Bool(x != 0.0 && y != 0.0),
            NativeFunction::Or => Value::Bool(x != 0.0 || y != 0.0),
            NativeFunction::Max => Value::Float(x.max(y)),
            NativeFunction::Min => Value::Float(x.min(y)),
            NativeFunction::Pow => Value::Float(x.powf(y)),
            _ => return Err(self.unsupported(ValueType::Float)),
        })
    }

    fn string_binary(self, x: &str, y: &str) -> Result<Value> {
        Ok(match self {
            NativeFunction::Add => Value::String(format!("{}{}", x, y)),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::Has => Value::Bool(x.contains(y)),
            NativeFunction::Hasnt => Value::Bool(!x.contains(y)),
            _ => return Err(self.unsupported(ValueType::String)),
        })
    }

    fn list_unary(self, x: &InkList, lists: &ListDefinitions) -> Result<Value> {
        Ok(match self {
            NativeFunction::Not => Value::Bool(x.is_empty()),
            NativeFunction::Invert => Value::List(x.inverse(lists)),
            NativeFunction::All => Value::List(x.all(lists)),
            NativeFunction::ListMin => Value::List(x.min_as_list()),
            NativeFunction::ListMax => Value::List(x.max_as_list()),
            NativeFunction::Count => Value::Int(x.len() as i32),
            NativeFunction::ValueOfList => Value::Int(x.max_item().map_or(0, |(_, v)| v)),
            _ => return Err(self.unsupported(ValueType::List)),
        })
    }

    fn call_binary_list(self, a: &Value, b: &Value, lists: &ListDefinitions) -> Result<Value> {
        if let (Value::List(list), Value::Int(delta)) = (a, b) {
            if matches!(self, NativeFunction::Add | NativeFunction::Subtract) {
                return Ok(Value::List(self.list_increment(list, *delta, lists)));
            }
        }

        if matches!(self, NativeFunction::And | NativeFunction::Or)
            && (a.value_type() != ValueType::List || b.value_type() != ValueType::List)
        {
            let (x, y) = (a.is_truthy()?, b.is_truthy()?);
            return Ok(Value::Bool(match self {
                NativeFunction::And => x && y,
                _ => x || y,
            }));
        }

        let (Value::List(x), Value::List(y)) = (a, b) else {
            return Err(RuntimeError::story(format!(
                "Can not call use '{}' operation on {:?} and {:?}",
                self,
                a.value_type(),
                b.value_type()
            )));
        };

        Ok(match self {
            NativeFunction::Add => Value::List(x.union(y)),
            NativeFunction::Subtract => Value::List(x.without(y)),
            NativeFunction::Has => Value::Bool(x.contains(y)),
            NativeFunction::Hasnt => Value::Bool(!x.contains(y)),
            NativeFunction::Intersect => Value::List(x.intersect(y)),
            NativeFunction::Equal => Value::Bool(x == y),
            NativeFunction::NotEquals => Value::Bool(x != y),
            NativeFunction::Greater => Value::Bool(x.greater_than(y)),
            NativeFunction::Less => Value::Bool(x.less_than(y)),
            NativeFunction::GreaterThanOrEquals => Value::Bool(x.greater_than_or_equals(y)),
            NativeFunction::LessThanOrEquals => Value::Bool(x.less_than_or_equals(y)),
            NativeFunction::And => Value::Bool(!x.is_empty() && !y.is_empty()),
            NativeFunction::Or => Value::Bool(!x.is_empty() || !y.is_empty()),
            _ => return Err(self.unsupported(ValueType::List)),
        })
    }

    /// `list + n` moves every item `n` steps along its own definition, dropping items that fall off.
    fn list_increment(self, list: &InkList, delta: i32, lists: &ListDefinitions) -> InkList {
        let mut result = InkList::new();
        for (item, value) in list.items() {
            let target = match self {
                NativeFunction::Subtract => value.wrapping_sub(delta),
                _ => value.wrapping_add(delta),
            };
            let origin = item.origin_name.as_deref().and_then(|name| lists.get(name));
            if let Some(next) = origin.and_then(|origin| origin.item_with_value(target)) {
                result.insert(next, target);
            }
        }
        result
    }
}

impl fmt::Display for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ListDefinition, ListItem};

    fn call(name: &str, params: Vec<Value>) -> Result<Value> {
        NativeFunction::from_name(name)
            .unwrap()
            .call(params, &ListDefinitions::default())
    }

    #[test]
    fn coerces_to_highest_rank() {
        assert_eq!(
            call("+", vec![Value::Int(1), Value::Float(1.5)]).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            call("+", vec![Value::String("a".into()), Value::Int(1)]).unwrap(),
            Value::String("a1".into())
        );
        assert_eq!(
            call("==", vec![Value::Bool(true), Value::Int(1)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn integer_semantics() {
        assert_eq!(call("/", vec![7.into(), 2.into()]).unwrap(), Value::Int(3));
        assert_eq!(call("%", vec![7.into(), 2.into()]).unwrap(), Value::Int(1));
        assert_eq!(call("_", vec![4.into()]).unwrap(), Value::Int(-4));
        assert!(matches!(
            call("/", vec![1.into(), 0.into()]),
            Err(RuntimeError::Story(_))
        ));
        assert_eq!(call("FLOOR", vec![Value::Float(2.7)]).unwrap(), Value::Float(2.0));
        assert_eq!(call("INT", vec![Value::Float(2.7)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn unsupported_operation() {
        let err = call(">", vec!["a".into(), "b".into()]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot perform operation > on String");
    }

    #[test]
    fn list_increment_follows_origin() {
        let lists = ListDefinitions::new(vec![ListDefinition::new(
            "Days",
            vec![("mon".into(), 1), ("tue".into(), 2)],
        )]);
        let mon = Value::List(InkList::from_item(ListItem::new("Days", "mon"), 1));
        let result = NativeFunction::Add
            .call(vec![mon.clone(), Value::Int(1)], &lists)
            .unwrap();
        assert_eq!(
            result,
            Value::List(InkList::from_item(ListItem::new("Days", "tue"), 2))
        );

        let gone = NativeFunction::Subtract
            .call(vec![mon, Value::Int(1)], &lists)
            .unwrap();
        assert_eq!(gone, Value::List(InkList::new()));
    }

    #[test]
    fn logic_with_list_and_int_uses_truthiness() {
        let list = Value::List(InkList::from_item(ListItem::new("Days", "mon"), 1));
        assert_eq!(
            call("&&", vec![list.clone(), Value::Int(0)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(call("||", vec![list, Value::Int(0)]).unwrap(), Value::Bool(true));
    }
}
