//! Expression evaluation against `businessData` and `passData`.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::Value;

use streamflow_types::DataMap;

use super::ConditionError;
use super::parser::{CmpOp, Expr, Method, Path, Segment};

pub(crate) const BUSINESS_DATA: &str = "businessData";
pub(crate) const PASS_DATA: &str = "passData";

pub(crate) struct Scope<'a> {
    pub rule: &'a str,
    pub business: &'a DataMap,
    pub pass: &'a DataMap,
}

/// Position of a path walk. Fields are read by reference; only method
/// results and the root map handed to a method are owned.
enum Cursor<'v> {
    Map(&'v DataMap),
    Value(Cow<'v, Value>),
}

impl<'v> Cursor<'v> {
    fn owned(value: Value) -> Self {
        Cursor::Value(Cow::Owned(value))
    }

    fn borrowed((value, take): (&'v Value, usize)) -> (Self, usize) {
        (Cursor::Value(Cow::Borrowed(value)), take)
    }

    fn into_value(self) -> Cow<'v, Value> {
        match self {
            Cursor::Map(map) => Cow::Owned(Value::Object(map.clone())),
            Cursor::Value(value) => value,
        }
    }
}

/// First key of the compound run `a`, `a.b`, `a.b.c`... present in `map`.
fn field_run<'m>(map: &'m DataMap, fields: &[&str]) -> Option<(&'m Value, usize)> {
    (1..=fields.len()).find_map(|take| map.get(&fields[..take].join(".")).map(|value| (value, take)))
}

impl Scope<'_> {
    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, ConditionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => self.path(path),
            Expr::Placeholder(name) => Ok(self.placeholder(name)),
            Expr::Not(inner) => Ok(Value::Bool(!self.boolean(inner, "operand of `!`")?)),
            Expr::And(left, right) => Ok(Value::Bool(
                self.boolean(left, "operand of `&&`")? && self.boolean(right, "operand of `&&`")?,
            )),
            Expr::Or(left, right) => Ok(Value::Bool(
                self.boolean(left, "operand of `||`")? || self.boolean(right, "operand of `||`")?,
            )),
            Expr::Compare(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.compare(*op, &left, &right).map(Value::Bool)
            }
        }
    }

    pub(crate) fn boolean(&self, expr: &Expr, what: &str) -> Result<bool, ConditionError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(ConditionError::type_conversion(
                self.rule,
                format!("{what} must be a boolean, got {}", kind(&other)),
            )),
        }
    }

    fn root(&self, name: &str) -> Option<&DataMap> {
        match name {
            BUSINESS_DATA => Some(self.business),
            PASS_DATA => Some(self.pass),
            _ => None,
        }
    }

    fn path(&self, path: &Path) -> Result<Value, ConditionError> {
        let root = self.root(&path.root).ok_or_else(|| {
            ConditionError::parse(
                self.rule,
                format!(
                    "unknown variable `{}`, expected `{BUSINESS_DATA}` or `{PASS_DATA}`",
                    path.root
                ),
            )
        })?;

        let mut cursor = Cursor::Map(root);
        let mut i = 0;
        while i < path.segments.len() {
            match &path.segments[i] {
                Segment::Field(_) => {
                    let (next, consumed) = self.field(cursor, &path.segments[i..], path)?;
                    cursor = next;
                    i += consumed;
                }
                Segment::Method(method, args) => {
                    let target = cursor.into_value();
                    cursor = Cursor::owned(self.method(*method, &target, args)?);
                    i += 1;
                }
            }
        }
        Ok(cursor.into_value().into_owned())
    }

    /// Resolve the field run starting at `segments[0]`.
    ///
    /// A plain key is tried first, then compound keys joining it with the
    /// following field segments (`a.b.c` may address the key `"b.c"`). A
    /// missing last field yields `null`; anything missing in the middle of a
    /// path is unresolvable.
    fn field<'v>(
        &self,
        cursor: Cursor<'v>,
        segments: &[Segment],
        path: &Path,
    ) -> Result<(Cursor<'v>, usize), ConditionError> {
        let fields: Vec<&str> = segments
            .iter()
            .map_while(|s| match s {
                Segment::Field(name) => Some(name.as_str()),
                Segment::Method(..) => None,
            })
            .collect();

        let hit = match cursor {
            Cursor::Map(map) => field_run(map, &fields).map(Cursor::borrowed),
            Cursor::Value(Cow::Borrowed(Value::Object(map))) => {
                field_run(map, &fields).map(Cursor::borrowed)
            }
            Cursor::Value(Cow::Owned(Value::Object(map))) => {
                field_run(&map, &fields).map(|(value, take)| (Cursor::owned(value.clone()), take))
            }
            Cursor::Value(other) => {
                if other.is_null() && segments.len() == 1 {
                    return Ok((Cursor::owned(Value::Null), 1));
                }
                return Err(ConditionError::parse(
                    self.rule,
                    format!(
                        "cannot read `{}` of a {} in `{}`",
                        fields[0],
                        kind(&*other),
                        describe(path)
                    ),
                ));
            }
        };
        if let Some(hit) = hit {
            return Ok(hit);
        }

        if segments.len() == 1 || matches!(segments.get(1), Some(Segment::Method(..))) {
            return Ok((Cursor::owned(Value::Null), 1));
        }
        Err(ConditionError::parse(
            self.rule,
            format!("cannot resolve `{}` in `{}`", fields[0], describe(path)),
        ))
    }

    fn method(&self, method: Method, target: &Value, args: &[Expr]) -> Result<Value, ConditionError> {
        let arg = match args.first() {
            Some(expr) => Some(self.eval(expr)?),
            None => None,
        };
        let unsupported = || {
            ConditionError::type_conversion(
                self.rule,
                format!("`{}()` is not defined on a {}", method.name(), kind(target)),
            )
        };
        let result = match (method, target) {
            (Method::Len, Value::String(s)) => Value::from(s.chars().count()),
            (Method::Len, Value::Array(a)) => Value::from(a.len()),
            (Method::Len, Value::Object(o)) => Value::from(o.len()),
            (Method::Len, Value::Null) => Value::from(0),
            (Method::IsEmpty, Value::String(s)) => Value::Bool(s.is_empty()),
            (Method::IsEmpty, Value::Array(a)) => Value::Bool(a.is_empty()),
            (Method::IsEmpty, Value::Object(o)) => Value::Bool(o.is_empty()),
            (Method::IsEmpty, Value::Null) => Value::Bool(true),
            (Method::Contains, Value::Null)
            | (Method::StartsWith, Value::Null)
            | (Method::EndsWith, Value::Null) => Value::Bool(false),
            (Method::Contains, Value::Array(items)) => {
                let needle = arg.unwrap_or(Value::Null);
                Value::Bool(items.iter().any(|item| loosely_equal(item, &needle)))
            }
            (Method::Contains, Value::Object(map)) => match arg {
                Some(Value::String(key)) => Value::Bool(map.contains_key(&key)),
                _ => return Err(self.string_argument(method)),
            },
            (Method::Contains, Value::String(s)) => match arg {
                Some(Value::String(needle)) => Value::Bool(s.contains(needle.as_str())),
                _ => return Err(self.string_argument(method)),
            },
            (Method::StartsWith, Value::String(s)) => match arg {
                Some(Value::String(prefix)) => Value::Bool(s.starts_with(prefix.as_str())),
                _ => return Err(self.string_argument(method)),
            },
            (Method::EndsWith, Value::String(s)) => match arg {
                Some(Value::String(suffix)) => Value::Bool(s.ends_with(suffix.as_str())),
                _ => return Err(self.string_argument(method)),
            },
            _ => return Err(unsupported()),
        };
        Ok(result)
    }

    fn string_argument(&self, method: Method) -> ConditionError {
        ConditionError::type_conversion(
            self.rule,
            format!("`{}()` needs a string argument", method.name()),
        )
    }

    /// `{{name}}`: the key in business data, then pass data, then the same
    /// lookup as a dotted path. Missing values are `null`.
    fn placeholder(&self, name: &str) -> Value {
        for map in [self.business, self.pass] {
            if let Some(value) = map.get(name) {
                return value.clone();
            }
        }
        let parts: Vec<&str> = name.split('.').collect();
        for map in [self.business, self.pass] {
            if let Some(value) = lookup_dotted(map, &parts) {
                return value;
            }
        }
        Value::Null
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
        match op {
            CmpOp::Eq => return Ok(loosely_equal(left, right)),
            CmpOp::Ne => return Ok(!loosely_equal(left, right)),
            _ => {}
        }
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };
        let Some(ordering) = ordering else {
            return Err(ConditionError::type_conversion(
                self.rule,
                format!(
                    "cannot compare {} {} {}",
                    kind(left),
                    op.symbol(),
                    kind(right)
                ),
            ));
        };
        Ok(match op {
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
        })
    }
}

fn lookup_dotted(map: &DataMap, parts: &[&str]) -> Option<Value> {
    for take in (1..=parts.len()).rev() {
        let key = parts[..take].join(".");
        let Some(value) = map.get(&key) else {
            continue;
        };
        if take == parts.len() {
            return Some(value.clone());
        }
        if let Value::Object(inner) = value {
            if let Some(found) = lookup_dotted(inner, &parts[take..]) {
                return Some(found);
            }
        }
    }
    None
}

/// Equality with numbers compared by value, so `1 == 1.0`.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn describe(path: &Path) -> String {
    let mut out = path.root.clone();
    for segment in &path.segments {
        match segment {
            Segment::Field(name) => {
                out.push('.');
                out.push_str(name);
            }
            Segment::Method(method, _) => {
                out.push('.');
                out.push_str(method.name());
                out.push_str("()");
            }
        }
    }
    out
}
