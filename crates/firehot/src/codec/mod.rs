//! Call serialization across the fork boundary.
//!
//! A call is shipped as the dotted path of the module that owns the
//! callable, the callable's bare name, and its arguments. The worker never
//! receives code, only the reference, and resolves it against its own
//! [`Registry`](crate::registry::Registry).
//!
//! Wire form: bincode-encoded [`SerializedCall`], then standard base64 so
//! the payload can be embedded as a string in a JSON protocol line.

mod value;

pub use value::Value;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bincode::{Decode, Encode};

use crate::error::{Error, Result};
use crate::registry::FunctionRef;

/// Arguments for an isolated call.
///
/// The three shapes are kept apart so the worker can reproduce the exact
/// calling convention of the caller.
#[derive(Debug, Clone, PartialEq, Default, Encode, Decode)]
pub enum CallArgs {
    /// Zero-argument call.
    #[default]
    Absent,
    /// One positional argument.
    Single(Value),
    /// Positional unpack of every element.
    Tuple(Vec<Value>),
}

impl CallArgs {
    pub fn none() -> Self {
        CallArgs::Absent
    }

    pub fn one(value: impl Into<Value>) -> Self {
        CallArgs::Single(value.into())
    }

    pub fn tuple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        CallArgs::Tuple(values.into_iter().map(Into::into).collect())
    }

    /// Positional argument list the callable is invoked with.
    pub fn positional(&self) -> Vec<Value> {
        match self {
            CallArgs::Absent => Vec::new(),
            CallArgs::Single(value) => vec![value.clone()],
            CallArgs::Tuple(values) => values.clone(),
        }
    }
}

/// Portable description of one call.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SerializedCall {
    /// Dotted path of the owning module. `None` for entry-script callables,
    /// which are rejected before they reach a worker.
    pub module_path: Option<String>,
    /// Bare function name inside the module.
    pub function_name: String,
    /// Call arguments.
    pub args: CallArgs,
}

/// Serialize a call for a worker.
///
/// Fails with [`Error::UnsupportedCallable`] when the callable has no owning
/// module: workers re-import the module to find the function, so a callable
/// that only exists in the entry script can never be resolved.
pub fn encode_call(func: &FunctionRef, args: CallArgs) -> Result<String> {
    let Some(module) = func.module() else {
        return Err(Error::UnsupportedCallable(format!(
            "function {} belongs to the entry script, currently only module functions are supported",
            func.name()
        )));
    };

    let call = SerializedCall {
        module_path: Some(module.to_string()),
        function_name: func.name().to_string(),
        args,
    };
    to_text(&call)
}

/// Reverse of [`encode_call`].
pub fn decode_call(text: &str) -> Result<SerializedCall> {
    from_text(text)
}

/// Encode a return value for transport back to the host.
pub fn encode_value(value: &Value) -> Result<String> {
    to_text(value)
}

pub fn decode_value(text: &str) -> Result<Value> {
    from_text(text)
}

fn to_text<T: Encode>(item: &T) -> Result<String> {
    let bytes = bincode::encode_to_vec(item, bincode::config::standard())
        .map_err(|e| Error::Codec(format!("failed to encode payload: {}", e)))?;
    Ok(STANDARD.encode(bytes))
}

fn from_text<T: Decode<()>>(text: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Codec(format!("payload is not valid base64: {}", e)))?;
    let (item, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| Error::Codec(format!("failed to decode payload: {}", e)))?;
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_shapes() {
        assert!(CallArgs::none().positional().is_empty());
        assert_eq!(CallArgs::one("World").positional(), vec![Value::from("World")]);
        assert_eq!(
            CallArgs::tuple([1, 2, 3]).positional(),
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
    }

    #[test]
    fn test_single_tuple_stays_a_tuple() {
        // Same positional view, still distinct on the wire.
        let tuple = CallArgs::tuple([Value::List(vec![Value::from(1)])]);
        let single = CallArgs::one(Value::List(vec![Value::from(1)]));
        assert_eq!(tuple.positional(), single.positional());

        let decoded_tuple = decode_call(
            &encode_call(&FunctionRef::new("pkg.mod", "f"), tuple.clone()).unwrap(),
        )
        .unwrap();
        assert_eq!(decoded_tuple.args, tuple);
        assert_ne!(decoded_tuple.args, single);
    }

    #[test]
    fn test_encode_call_carries_reference() {
        let func = FunctionRef::new("sample.greetings", "function_with_success");
        let text = encode_call(&func, CallArgs::one("World")).unwrap();

        assert!(STANDARD.decode(&text).is_ok(), "payload must be base64 text");

        let call = decode_call(&text).unwrap();
        assert_eq!(call.module_path.as_deref(), Some("sample.greetings"));
        assert_eq!(call.function_name, "function_with_success");
        assert_eq!(call.args, CallArgs::Single(Value::from("World")));
    }

    #[test]
    fn test_entry_script_callable_is_rejected() {
        let func = FunctionRef::script("helper");
        let err = encode_call(&func, CallArgs::none()).unwrap_err();
        match err {
            Error::UnsupportedCallable(message) => {
                assert!(message.contains("helper"));
                assert!(message.contains("only module functions are supported"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        assert!(matches!(decode_call("%%%"), Err(Error::Codec(_))));
        // A lone `Some` tag with nothing after it.
        assert!(matches!(decode_call("AQ=="), Err(Error::Codec(_))));
    }

    #[test]
    fn test_value_transport() {
        let value = Value::List(vec![Value::Float(1.5), Value::Bytes(vec![0, 255])]);
        let text = encode_value(&value).unwrap();
        assert_eq!(decode_value(&text).unwrap(), value);
    }
}
