// ABOUTME: Wire format for batched calls: compiles tasks into one VKScript `execute` body.
// ABOUTME: Also decodes concatenated JSON response documents and splits results per task.

use crate::task::ApiCall;
use serde_json::Value;

/// Remote limit on sub-calls inside one `execute` script
pub const MAX_BATCH_SIZE: usize = 25;

/// Serialization boundary between scheduling and the batch wire format
pub trait BatchCodec: Send + Sync {
    /// Compile calls into a single request body
    fn compile(&self, calls: &[&ApiCall]) -> String;

    /// Split the batch response into one result per call, in order.
    ///
    /// A falsy overall response yields `None` for every call.
    fn split(&self, response: Value, count: usize) -> Vec<Option<Value>>;
}

/// VKScript `execute` codec: `return [API.m({k: "v"}), ...];`
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecuteScript;

impl ExecuteScript {
    fn quote(value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for ch in value.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                _ => out.push(ch),
            }
        }
        out.push('"');
        out
    }

    fn compile_call(call: &ApiCall) -> String {
        let args: Vec<String> = call
            .params
            .iter()
            .map(|(k, v)| format!("{}: {}", k, Self::quote(v)))
            .collect();
        format!("API.{}({{{}}})", call.method, args.join(", "))
    }
}

impl BatchCodec for ExecuteScript {
    fn compile(&self, calls: &[&ApiCall]) -> String {
        let body: Vec<String> = calls.iter().map(|c| Self::compile_call(c)).collect();
        format!("return [{}];", body.join(", "))
    }

    fn split(&self, response: Value, count: usize) -> Vec<Option<Value>> {
        if !is_truthy(&response) {
            return vec![None; count];
        }
        let mut items = match response {
            Value::Array(items) => items.into_iter(),
            other => vec![other].into_iter(),
        };
        (0..count)
            .map(|_| items.next().and_then(non_null))
            .collect()
    }
}

/// Replace newlines with `<br>`, the escaping VK expects inside `code`
pub fn escape_newlines(code: &str) -> String {
    code.replace('\n', "<br>")
}

/// Decode one or more concatenated JSON documents from a response body
pub fn parse_documents(body: &str) -> Result<Vec<Value>, serde_json::Error> {
    serde_json::Deserializer::from_str(body)
        .into_iter::<Value>()
        .collect()
}

/// JSON truthiness as the remote scripting layer sees it
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A `[false]` response marks a server-side scripting failure
pub fn is_script_failure(value: &Value) -> bool {
    matches!(value, Value::Array(items) if matches!(items.first(), Some(Value::Bool(false))))
}

fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}
