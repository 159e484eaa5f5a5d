//! Executor terminal output
//!
//! A computation plugin must write exactly one JSON object to stdout before
//! exiting. Surrounding whitespace is tolerated; anything else is malformed.

use std::fmt;

use serde_json::Deserializer;

use flame_core::{FailureKind, Payload};

/// Why a plugin's stdout was rejected
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedOutput(pub String);

impl MalformedOutput {
    pub fn kind(&self) -> FailureKind {
        FailureKind::MalformedOutput
    }
}

impl fmt::Display for MalformedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the single terminal JSON object from plugin stdout
pub fn parse_terminal_output(stdout: &[u8]) -> Result<Payload, MalformedOutput> {
    let mut values = Deserializer::from_slice(stdout).into_iter::<Payload>();

    let first = match values.next() {
        Some(Ok(value)) => value,
        Some(Err(err)) => return Err(MalformedOutput(format!("invalid JSON: {err}"))),
        None => return Err(MalformedOutput("no output".into())),
    };
    if !first.is_object() {
        return Err(MalformedOutput("terminal output must be a JSON object".into()));
    }

    match values.next() {
        None => Ok(first),
        Some(Ok(_)) => Err(MalformedOutput("more than one JSON value".into())),
        Some(Err(err)) => Err(MalformedOutput(format!("trailing data: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_single_object() {
        let out = parse_terminal_output(b"  {\"value\": 2.5}\n").unwrap();
        assert_eq!(out, json!({"value": 2.5}));
    }

    #[test]
    fn test_rejections() {
        for raw in [
            &b""[..],
            b"   \n",
            b"[1, 2]",
            b"42",
            b"{\"a\": 1}{\"b\": 2}",
            b"{\"a\": 1} trailing",
            b"loading data...\n{\"a\": 1}",
            b"{\"a\": ",
        ] {
            assert!(parse_terminal_output(raw).is_err(), "{:?}", String::from_utf8_lossy(raw));
        }
    }

    proptest! {
        #[test]
        fn prop_any_object_with_whitespace_parses(
            key in "[a-z]{1,8}",
            value in any::<i64>(),
            lead in "[ \n\t]{0,4}",
            trail in "[ \n\t]{0,4}",
        ) {
            let mut map = serde_json::Map::new();
            map.insert(key, json!(value));
            let body = Payload::Object(map);
            let raw = format!("{lead}{body}{trail}");
            prop_assert_eq!(parse_terminal_output(raw.as_bytes()).unwrap(), body);
        }
    }
}
