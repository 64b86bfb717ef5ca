use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::error::ExportError;
use crate::payload::{Exportable, Payload};

pub const PLACEHOLDER: &str = "<unrepresentable>";
pub const DEPTH_PLACEHOLDER: &str = "<max depth exceeded>";
pub const CYCLE_PLACEHOLDER: &str = "<cycle>";
pub const MAX_DEPTH: usize = 64;
/// Upper bound on nodes visited by one `sanitize` call.
pub const MAX_NODES: usize = 10_000;

/// Converts any payload into a JSON-safe tree. Never fails.
pub fn sanitize(value: &Payload) -> Value {
    Walk::default().value(value, 0)
}

/// Sanitizes a top-level event. Mappings become the record itself, anything else is
/// wrapped as `{"value": ...}`.
pub fn sanitize_event(value: &Payload) -> Map<String, Value> {
    let mut walk = Walk::default();
    match value {
        Payload::Map(entries) => entries
            .iter()
            .map(|(k, v)| (walk.key(k, 1), walk.value(v, 1)))
            .collect(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), walk.value(other, 1));
            map
        }
    }
}

/// State for one sanitize call: exported objects on the current path and nodes visited so far.
#[derive(Default)]
struct Walk {
    path: Vec<usize>,
    visited: usize,
}

impl Walk {
    fn value(&mut self, value: &Payload, depth: usize) -> Value {
        self.visited += 1;
        if depth > MAX_DEPTH || self.visited > MAX_NODES {
            return Value::String(DEPTH_PLACEHOLDER.into());
        }
        match value {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Int(i) => Value::from(*i),
            Payload::UInt(u) => Value::from(*u),
            Payload::Float(x) => match Number::from_f64(*x) {
                Some(n) => Value::Number(n),
                None => Value::String(x.to_string()),
            },
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Time(t) => Value::String(t.to_rfc3339()),
            Payload::Map(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    let key = self.key(k, depth + 1);
                    out.insert(key, self.value(v, depth + 1));
                }
                Value::Object(out)
            }
            Payload::List(items) => Value::Array(items.iter().map(|v| self.value(v, depth + 1)).collect()),
            Payload::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            Payload::Object(obj) => {
                let addr = Arc::as_ptr(obj) as *const () as usize;
                if self.path.contains(&addr) {
                    return Value::String(CYCLE_PLACEHOLDER.into());
                }
                self.path.push(addr);
                let out = self.object(obj.as_ref(), depth);
                self.path.pop();
                out
            }
        }
    }

    fn object(&mut self, obj: &dyn Exportable, depth: usize) -> Value {
        if let Ok(dict) = guarded(|| obj.to_dict()) {
            return self.value(&dict, depth + 1);
        }
        if let Ok(raw) = guarded(|| obj.to_json()) {
            return match serde_json::from_str::<Value>(&raw) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(raw),
            };
        }
        match guarded(|| obj.render()) {
            Ok(text) => Value::String(text),
            Err(_) => Value::String(PLACEHOLDER.into()),
        }
    }

    fn key(&mut self, key: &Payload, depth: usize) -> String {
        match key {
            Payload::Text(s) => s.clone(),
            other => match self.value(other, depth) {
                Value::String(s) => s,
                Value::Null => "null".into(),
                rendered => rendered.to_string(),
            },
        }
    }
}

/// Runs one export call, turning a panic in producer code into an error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, ExportError>) -> Result<T, ExportError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(ExportError::Panicked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::OnceLock;

    struct Dict;
    impl Exportable for Dict {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            Ok(Payload::map([("kind", Payload::from("dict")), ("n", Payload::from(3i64))]))
        }
    }

    struct JsonOnly(&'static str);
    impl Exportable for JsonOnly {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            Err(ExportError::failed("boom"))
        }
        fn to_json(&self) -> Result<String, ExportError> {
            Ok(self.0.to_string())
        }
    }

    struct Panicky;
    impl Exportable for Panicky {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            panic!("to_dict exploded")
        }
        fn to_json(&self) -> Result<String, ExportError> {
            panic!("to_json exploded")
        }
        fn render(&self) -> Result<String, ExportError> {
            Ok("panicky".into())
        }
    }

    struct Nothing;
    impl Exportable for Nothing {}

    // Every export yields a fresh copy of itself nested one level down.
    struct SelfReferential;
    impl Exportable for SelfReferential {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            Ok(Payload::map([("me", Payload::object(SelfReferential))]))
        }
    }

    // A linked node whose export points back at itself twice.
    struct Node {
        me: OnceLock<Payload>,
    }
    impl Exportable for Node {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            let me = self.me.get().cloned().unwrap_or(Payload::Null);
            Ok(Payload::map([("next", me.clone()), ("prev", me)]))
        }
    }

    fn looped_node() -> Payload {
        let node = Arc::new(Node { me: OnceLock::new() });
        let payload = Payload::Object(node.clone());
        let _ = node.me.set(payload.clone());
        payload
    }

    // Every export yields two fresh children, so no address ever repeats.
    struct Fanout;
    impl Exportable for Fanout {
        fn to_dict(&self) -> Result<Payload, ExportError> {
            Ok(Payload::map([("l", Payload::object(Fanout)), ("r", Payload::object(Fanout))]))
        }
    }

    fn is_json_safe(v: &Value) -> bool {
        match v {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
            Value::Array(items) => items.iter().all(is_json_safe),
            Value::Object(map) => map.values().all(is_json_safe),
        }
    }

    #[test]
    fn primitives_and_time_pass_through() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let p = Payload::List(vec![
            Payload::Null,
            true.into(),
            42i64.into(),
            1.5f64.into(),
            "hi".into(),
            t.into(),
        ]);
        assert_eq!(sanitize(&p), json!([null, true, 42, 1.5, "hi", "2024-05-01T12:00:00+00:00"]));
    }

    #[test]
    fn map_keys_are_coerced_to_strings() {
        let p = Payload::Map(vec![
            (Payload::Int(1), "one".into()),
            (Payload::Bool(true), "yes".into()),
            (Payload::Null, "nothing".into()),
        ]);
        assert_eq!(sanitize(&p), json!({"1": "one", "true": "yes", "null": "nothing"}));
    }

    #[test]
    fn objects_use_first_working_export() {
        assert_eq!(sanitize(&Payload::object(Dict)), json!({"kind": "dict", "n": 3}));
        assert_eq!(sanitize(&Payload::object(JsonOnly(r#"{"a":[1,2]}"#))), json!({"a": [1, 2]}));
        assert_eq!(sanitize(&Payload::object(JsonOnly("not json"))), json!("not json"));
    }

    #[test]
    fn panicking_exports_fall_through_to_render() {
        assert_eq!(sanitize(&Payload::object(Panicky)), json!("panicky"));
    }

    #[test]
    fn unrenderable_object_gets_placeholder() {
        assert_eq!(sanitize(&Payload::object(Nothing)), json!(PLACEHOLDER));
    }

    #[test]
    fn self_referential_export_terminates() {
        let v = sanitize(&Payload::object(SelfReferential));
        assert!(is_json_safe(&v));
        assert!(v.to_string().contains(DEPTH_PLACEHOLDER));
    }

    #[test]
    fn branching_cycle_is_cut_at_first_repeat() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(sanitize(&looped_node()));
        });
        let v = rx.recv_timeout(std::time::Duration::from_secs(10)).expect("sanitize did not terminate");
        assert_eq!(v, json!({"next": CYCLE_PLACEHOLDER, "prev": CYCLE_PLACEHOLDER}));
    }

    #[test]
    fn shared_object_in_sibling_positions_is_not_a_cycle() {
        let shared = Payload::object(Dict);
        let v = sanitize(&Payload::List(vec![shared.clone(), shared]));
        assert_eq!(v, json!([{"kind": "dict", "n": 3}, {"kind": "dict", "n": 3}]));
    }

    #[test]
    fn generative_fanout_stops_at_node_budget() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(sanitize(&Payload::object(Fanout)));
        });
        let v = rx.recv_timeout(std::time::Duration::from_secs(10)).expect("sanitize did not terminate");
        assert!(is_json_safe(&v));
        assert!(v.to_string().contains(DEPTH_PLACEHOLDER));
    }

    #[test]
    fn non_finite_floats_become_strings() {
        assert_eq!(sanitize(&Payload::Float(f64::NAN)), json!("NaN"));
        assert_eq!(sanitize(&Payload::Float(f64::INFINITY)), json!("inf"));
    }

    #[test]
    fn bytes_render_lossy() {
        assert_eq!(sanitize(&Payload::Bytes(b"abc\xff".to_vec())), json!("abc\u{fffd}"));
    }

    #[test]
    fn non_mapping_event_is_wrapped() {
        let ev = sanitize_event(&Payload::from("hello"));
        assert_eq!(Value::Object(ev), json!({"value": "hello"}));

        let ev = sanitize_event(&Payload::from(json!({"role": "user", "content": "x"})));
        assert_eq!(Value::Object(ev), json!({"role": "user", "content": "x"}));
    }

    #[test]
    fn mixed_tree_is_always_json_safe() {
        let p = Payload::map([
            ("a", Payload::object(Panicky)),
            ("b", Payload::List(vec![Payload::object(Nothing), Payload::object(SelfReferential)])),
            ("c", Payload::Float(f64::NEG_INFINITY)),
        ]);
        let v = sanitize(&p);
        assert!(is_json_safe(&v));
        assert!(serde_json::to_string(&v).is_ok());
    }
}
