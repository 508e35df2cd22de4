use crate::message::Message;

/// Wire tag for each value kind. Both sides share this numbering, so it
/// must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Real64 = 1,
    Int64 = 2,
    Bool = 3,
    String = 4,
    Bytes = 5,
    Message = 6,
    List = 7,
}

impl ValueKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Real64),
            2 => Some(Self::Int64),
            3 => Some(Self::Bool),
            4 => Some(Self::String),
            5 => Some(Self::Bytes),
            6 => Some(Self::Message),
            7 => Some(Self::List),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int64(i64),
    Real64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Message(Box<Message>),
    List(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int64(_) => ValueKind::Int64,
            Value::Real64(_) => ValueKind::Real64,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Message(_) => ValueKind::Message,
            Value::List(_) => ValueKind::List,
        }
    }

    /// Numeric view shared by the integer getters. Strings are parsed the
    /// way a loosely typed peer would have sent them.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Real64(v) => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Real64(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int64(v) => Some(*v != 0),
            Value::Real64(v) => Some(*v != 0.0),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int64(v) => Some(v.to_string()),
            Value::Real64(v) => Some(v.to_string()),
            Value::Bool(v) => Some(v.to_string()),
            Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            Value::Message(_) | Value::List(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int64(v) => serde_json::Value::from(*v),
            Value::Real64(v) => serde_json::Value::from(*v),
            Value::Bool(v) => serde_json::Value::from(*v),
            Value::String(s) => serde_json::Value::from(s.as_str()),
            Value::Bytes(bytes) => serde_json::Value::from(hex(bytes)),
            Value::Message(m) => m.to_json(),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 15) as usize] as char);
    }
    out
}

macro_rules! value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Int64(i64::from(v))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real64(f64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Message> for Value {
    fn from(v: Message) -> Self {
        Value::Message(Box::new(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_are_stable() {
        for kind in [
            ValueKind::Real64,
            ValueKind::Int64,
            ValueKind::Bool,
            ValueKind::String,
            ValueKind::Bytes,
            ValueKind::Message,
            ValueKind::List,
        ] {
            assert_eq!(ValueKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(ValueKind::Real64.as_byte(), 1);
        assert_eq!(ValueKind::Int64.as_byte(), 2);
        assert_eq!(ValueKind::from_byte(0), None);
        assert_eq!(ValueKind::from_byte(8), None);
    }

    #[test]
    fn numeric_coercion_follows_peer_conventions() {
        assert_eq!(Value::Real64(3.9).as_i64(), Some(3));
        assert_eq!(Value::Bool(true).as_i64(), Some(1));
        assert_eq!(Value::from(" 42 ").as_i64(), Some(42));
        assert_eq!(Value::Int64(7).as_f64(), Some(7.0));
        assert_eq!(Value::Int64(0).as_bool(), Some(false));
        assert_eq!(Value::Bytes(vec![1]).as_i64(), None);
    }

    #[test]
    fn small_integers_widen_to_int64() {
        assert_eq!(Value::from(5_u8), Value::Int64(5));
        assert_eq!(Value::from(-5_i32), Value::Int64(-5));
        assert_eq!(Value::from(u32::MAX), Value::Int64(i64::from(u32::MAX)));
    }

    #[test]
    fn bytes_render_as_hex_in_json() {
        let json = Value::Bytes(vec![0x00, 0xAB, 0x7F]).to_json();
        assert_eq!(json, "00AB7F");
    }
}
