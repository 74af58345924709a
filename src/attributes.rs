use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Free-form attribute bag describing the entity being evaluated. Constraints look up their
/// `property` here.
///
/// # Examples
/// ```
/// # use flagent::{EntityContext, AttributeValue};
/// let context = [
///     ("age".to_owned(), 30.0.into()),
///     ("beta".to_owned(), true.into()),
///     ("tier".to_owned(), "premium".into()),
/// ].into_iter().collect::<EntityContext>();
/// ```
pub type EntityContext = HashMap<String, AttributeValue>;

/// Enum representing possible values of an entity attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Return the string if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Textual form used by constraint operators. Every operator compares strings (numeric
    /// operators re-parse them), so all attribute types are flattened here.
    pub(crate) fn to_context_string(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(n) => n.to_string(),
            AttributeValue::Boolean(b) => b.to_string(),
            AttributeValue::Null => String::new(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}
