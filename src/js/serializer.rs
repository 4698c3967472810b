//! JSON-safe conversion for every value that crosses the sandbox boundary.
//!
//! Controller-side values are [`BoundaryValue`]s: plain data, host
//! functions, and opaque handles from the other privilege domain
//! ([`ForeignObject`]). Only their JSON-encodable shape ever reaches the
//! sandbox.

use std::fmt;
use std::rc::Rc;

use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::SerializationError;

/// Nesting limit for a single value.
pub const MAX_DEPTH: usize = 128;

/// A callable owned by the controller or by the page.
#[derive(Clone)]
pub struct HostFunction(Rc<dyn Fn(&[BoundaryValue]) -> BoundaryValue>);

impl HostFunction {
    pub fn new(f: impl Fn(&[BoundaryValue]) -> BoundaryValue + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: &[BoundaryValue]) -> BoundaryValue {
        (self.0)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunction(..)")
    }
}

/// An own property of a foreign object.
#[derive(Debug, Clone)]
pub struct ForeignProperty {
    pub key: String,
    pub value: BoundaryValue,
    pub enumerable: bool,
}

impl ForeignProperty {
    pub fn enumerable(key: impl Into<String>, value: impl Into<BoundaryValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enumerable: true,
        }
    }

    pub fn hidden(key: impl Into<String>, value: impl Into<BoundaryValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enumerable: false,
        }
    }
}

/// A live handle from the other privilege domain that is not plain data.
pub trait ForeignObject {
    fn class_name(&self) -> &str;

    /// Own string-keyed properties, in definition order.
    fn own_properties(&self) -> Vec<ForeignProperty>;
}

#[derive(Clone, Default)]
pub enum BoundaryValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<BoundaryValue>),
    /// Plain object; members keep insertion order.
    Object(Vec<(String, BoundaryValue)>),
    Function(HostFunction),
    Foreign(Rc<dyn ForeignObject>),
}

impl BoundaryValue {
    pub fn object<K: Into<String>>(members: impl IntoIterator<Item = (K, BoundaryValue)>) -> Self {
        Self::Object(
            members
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn array(items: impl IntoIterator<Item = BoundaryValue>) -> Self {
        Self::Array(items.into_iter().collect())
    }

    pub fn function(f: impl Fn(&[BoundaryValue]) -> BoundaryValue + 'static) -> Self {
        Self::Function(HostFunction::new(f))
    }

    pub fn foreign(object: impl ForeignObject + 'static) -> Self {
        Self::Foreign(Rc::new(object))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }
}

impl fmt::Debug for BoundaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Array(items) => f.debug_list().entries(items).finish(),
            Self::Object(members) => f
                .debug_map()
                .entries(members.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Function(_) => f.write_str("[function]"),
            Self::Foreign(object) => write!(f, "[foreign {}]", object.class_name()),
        }
    }
}

impl From<bool> for BoundaryValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for BoundaryValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for BoundaryValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for BoundaryValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for BoundaryValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<BoundaryValue>> for BoundaryValue {
    fn from(items: Vec<BoundaryValue>) -> Self {
        Self::Array(items)
    }
}

impl From<JsonValue> for BoundaryValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(value) => Self::Bool(value),
            JsonValue::Number(number) => Self::Number(number.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(value) => Self::String(value),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Which side of a channel the value is crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Sole argument of `postMessage`; a top-level function becomes absent.
    Message,
    /// One positional argument of `port.emit`; a top-level function becomes `null`.
    PortArgument,
}

/// Convert `value` to its JSON-safe shape. `Ok(None)` means `undefined`.
pub fn serialize(
    value: &BoundaryValue,
    boundary: Boundary,
) -> Result<Option<JsonValue>, SerializationError> {
    let mut walker = Walker::default();
    let flattened = walker.walk(value, 0)?;
    match boundary {
        Boundary::Message => Ok(flattened),
        Boundary::PortArgument => Ok(Some(flattened.unwrap_or(JsonValue::Null))),
    }
}

/// Serialize each port argument independently.
pub fn serialize_port_args(args: &[BoundaryValue]) -> Result<Vec<JsonValue>, SerializationError> {
    args.iter()
        .map(|arg| serialize(arg, Boundary::PortArgument).map(|v| v.unwrap_or(JsonValue::Null)))
        .collect()
}

#[derive(Default)]
struct Walker {
    /// Addresses of the foreign objects on the current path.
    ancestors: Vec<*const ()>,
    path: Vec<String>,
}

impl Walker {
    fn walk(
        &mut self,
        value: &BoundaryValue,
        depth: usize,
    ) -> Result<Option<JsonValue>, SerializationError> {
        if depth > MAX_DEPTH {
            return Err(SerializationError::TooDeep {
                path: self.path_string(),
                limit: MAX_DEPTH,
            });
        }

        let json = match value {
            BoundaryValue::Undefined | BoundaryValue::Function(_) => return Ok(None),
            BoundaryValue::Null => JsonValue::Null,
            BoundaryValue::Bool(value) => JsonValue::Bool(*value),
            BoundaryValue::Number(value) => number_to_json(*value),
            BoundaryValue::String(value) => JsonValue::String(value.clone()),
            BoundaryValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    self.path.push(index.to_string());
                    let flattened = self.walk(item, depth + 1)?;
                    self.path.pop();
                    out.push(flattened.unwrap_or(JsonValue::Null));
                }
                JsonValue::Array(out)
            }
            BoundaryValue::Object(members) => {
                let mut map = JsonMap::new();
                for (key, member) in members {
                    self.path.push(key.clone());
                    let flattened = self.walk(member, depth + 1)?;
                    self.path.pop();
                    if let Some(flattened) = flattened {
                        map.insert(key.clone(), flattened);
                    }
                }
                JsonValue::Object(map)
            }
            BoundaryValue::Foreign(object) => {
                let address = Rc::as_ptr(object) as *const ();
                if self.ancestors.contains(&address) {
                    return Err(SerializationError::Cycle {
                        path: self.path_string(),
                    });
                }
                self.ancestors.push(address);
                let mut map = JsonMap::new();
                for property in object.own_properties() {
                    if !property.enumerable || property.value.is_function() {
                        continue;
                    }
                    self.path.push(property.key.clone());
                    let flattened = self.walk(&property.value, depth + 1);
                    self.path.pop();
                    if let Some(flattened) = flattened? {
                        map.insert(property.key, flattened);
                    }
                }
                self.ancestors.pop();
                JsonValue::Object(map)
            }
        };
        Ok(Some(json))
    }

    fn path_string(&self) -> String {
        if self.path.is_empty() {
            "$".to_string()
        } else {
            format!("$.{}", self.path.join("."))
        }
    }
}

/// Integral numbers print without a fraction, as `JSON.stringify` does;
/// non-finite ones become `null`.
fn number_to_json(value: f64) -> JsonValue {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        return JsonValue::from(value as i64);
    }
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
