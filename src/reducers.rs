use std::collections::BTreeSet;

use serde_json::{Number, Value};

use crate::time;

/// One extracted pointer value flowing into a reducer. `included` is false
/// only for the peek sample (the first document of the following bucket),
/// which rate reducers use to close their last interval and every other
/// reducer ignores.
#[derive(Debug, Clone)]
pub struct PtrVal {
    pub key: Option<String>,
    pub val: Option<Value>,
    pub included: bool,
}

impl PtrVal {
    fn timestamp_nanos(&self) -> Option<i64> {
        let ns = time::parse_key(self.key.as_deref()?);
        (ns >= 0).then_some(ns)
    }

    /// Numeric view of the value. Extraction stringifies scalars, so the
    /// only numeric carrier is a string that parses as a float.
    fn numeric(&self) -> Option<f64> {
        match &self.val {
            Some(Value::String(s)) => s.parse::<f64>().ok(),
            _ => None,
        }
    }
}

/// A single-pass stream consumer: fed every sample in bucket order with the
/// peek sample last, then asked for its one result.
pub trait Reduce: Send {
    fn feed(&mut self, pv: &PtrVal);
    fn finish(self: Box<Self>) -> Value;
}

pub fn is_valid(name: &str) -> bool {
    build(name).is_some()
}

pub fn build(name: &str) -> Option<Box<dyn Reduce>> {
    let reducer: Box<dyn Reduce> = match name {
        "identity" => Box::new(Identity::default()),
        "any" => Box::new(Any::default()),
        "distinct" => Box::new(Distinct::default()),
        "count" => Box::new(Count::default()),
        "sum" => Box::new(Sum { squared: false, total: 0.0 }),
        "sumsq" => Box::new(Sum { squared: true, total: 0.0 }),
        "max" => Box::new(Extreme { want_max: true, current: None }),
        "min" => Box::new(Extreme { want_max: false, current: None }),
        "avg" => Box::new(Avg::default()),
        "c" => Box::new(Rate::new(RateMode::Sum)),
        "c_min" => Box::new(Rate::new(RateMode::Min)),
        "c_avg" => Box::new(Rate::new(RateMode::Avg)),
        "c_max" => Box::new(Rate::new(RateMode::Max)),
        "obj_keys" => Box::new(ObjKeys { distinct: false, keys: Vec::new() }),
        "obj_distinct_keys" => Box::new(ObjKeys { distinct: true, keys: Vec::new() }),
        _ => return None,
    };
    Some(reducer)
}

/// NaN and infinities have no JSON form and coerce to null. Whole floats
/// emit as integers, matching the wire format readers expect.
fn float_value(v: f64) -> Value {
    if !v.is_finite() {
        return Value::Null;
    }
    if v.fract() == 0.0 && v.abs() < 9.007_199_254_740_992e15 {
        return Value::Number(Number::from(v as i64));
    }
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

#[derive(Default)]
struct Identity {
    values: Vec<Value>,
}

impl Reduce for Identity {
    fn feed(&mut self, pv: &PtrVal) {
        if pv.included {
            self.values.push(pv.val.clone().unwrap_or(Value::Null));
        }
    }

    fn finish(self: Box<Self>) -> Value {
        Value::Array(self.values)
    }
}

#[derive(Default)]
struct Any {
    first: Option<Value>,
}

impl Reduce for Any {
    fn feed(&mut self, pv: &PtrVal) {
        if pv.included && self.first.is_none() {
            self.first = pv.val.clone();
        }
    }

    fn finish(self: Box<Self>) -> Value {
        self.first.unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct Distinct {
    seen: BTreeSet<String>,
}

impl Reduce for Distinct {
    fn feed(&mut self, pv: &PtrVal) {
        if pv.included {
            if let Some(Value::String(s)) = &pv.val {
                self.seen.insert(s.clone());
            }
        }
    }

    fn finish(self: Box<Self>) -> Value {
        Value::Array(self.seen.into_iter().map(Value::String).collect())
    }
}

#[derive(Default)]
struct Count {
    count: u64,
}

impl Reduce for Count {
    fn feed(&mut self, pv: &PtrVal) {
        if pv.included && pv.val.is_some() {
            self.count += 1;
        }
    }

    fn finish(self: Box<Self>) -> Value {
        Value::Number(Number::from(self.count))
    }
}

struct Sum {
    squared: bool,
    total: f64,
}

impl Reduce for Sum {
    fn feed(&mut self, pv: &PtrVal) {
        if !pv.included {
            return;
        }
        if let Some(x) = pv.numeric() {
            self.total += if self.squared { x * x } else { x };
        }
    }

    fn finish(self: Box<Self>) -> Value {
        float_value(self.total)
    }
}

struct Extreme {
    want_max: bool,
    current: Option<f64>,
}

impl Extreme {
    fn apply(&mut self, x: f64) {
        self.current = Some(match self.current {
            Some(cur) if self.want_max => cur.max(x),
            Some(cur) => cur.min(x),
            None => x,
        });
    }
}

impl Reduce for Extreme {
    fn feed(&mut self, pv: &PtrVal) {
        if !pv.included {
            return;
        }
        if let Some(x) = pv.numeric() {
            self.apply(x);
        }
    }

    fn finish(self: Box<Self>) -> Value {
        self.current.map(float_value).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct Avg {
    total: f64,
    count: u64,
}

impl Reduce for Avg {
    fn feed(&mut self, pv: &PtrVal) {
        if !pv.included {
            return;
        }
        if let Some(x) = pv.numeric() {
            self.total += x;
            self.count += 1;
        }
    }

    fn finish(self: Box<Self>) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        float_value(self.total / self.count as f64)
    }
}

enum RateMode {
    Sum,
    Min,
    Max,
    Avg,
}

/// Consumes consecutive (timestamp, numeric) pairs and aggregates the
/// per-interval rates Δvalue/Δseconds. The first usable pair only primes
/// state. Non-finite rates (including zero-width intervals) are dropped.
/// Unlike the plain reducers, the peek sample participates.
struct Rate {
    mode: RateMode,
    prev: Option<(i64, f64)>,
    total: f64,
    extreme: Option<f64>,
    count: u64,
}

impl Rate {
    fn new(mode: RateMode) -> Self {
        Self {
            mode,
            prev: None,
            total: 0.0,
            extreme: None,
            count: 0,
        }
    }
}

impl Reduce for Rate {
    fn feed(&mut self, pv: &PtrVal) {
        let (Some(ns), Some(v)) = (pv.timestamp_nanos(), pv.numeric()) else {
            return;
        };
        if let Some((prev_ns, prev_v)) = self.prev {
            // Exact integer delta first; the division is the only lossy step.
            let dt = (ns - prev_ns) as f64 / 1e9;
            let rate = (v - prev_v) / dt;
            if rate.is_finite() {
                self.total += rate;
                self.count += 1;
                self.extreme = Some(match (self.extreme, &self.mode) {
                    (Some(cur), RateMode::Max) => cur.max(rate),
                    (Some(cur), RateMode::Min) => cur.min(rate),
                    (Some(cur), _) => cur,
                    (None, _) => rate,
                });
            }
        }
        self.prev = Some((ns, v));
    }

    fn finish(self: Box<Self>) -> Value {
        match self.mode {
            RateMode::Sum => float_value(self.total),
            RateMode::Min | RateMode::Max => {
                self.extreme.map(float_value).unwrap_or(Value::Null)
            }
            RateMode::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    float_value(self.total / self.count as f64)
                }
            }
        }
    }
}

struct ObjKeys {
    distinct: bool,
    keys: Vec<String>,
}

impl Reduce for ObjKeys {
    fn feed(&mut self, pv: &PtrVal) {
        if !pv.included {
            return;
        }
        if let Some(Value::Object(map)) = &pv.val {
            self.keys.extend(map.keys().cloned());
        }
    }

    fn finish(self: Box<Self>) -> Value {
        let keys = if self.distinct {
            let unique: BTreeSet<String> = self.keys.into_iter().collect();
            unique.into_iter().collect()
        } else {
            self.keys
        };
        Value::Array(keys.into_iter().map(Value::String).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE_NS: i64 = 1_347_255_646_418_514_126;

    /// Mirrors the classic reducer-law stream: each value one second apart,
    /// with one trailing peek sample of "29".
    fn stream(values: &[Value]) -> Vec<PtrVal> {
        let mut out = Vec::new();
        let mut t = BASE_NS;
        for v in values {
            t += 1_000_000_000;
            out.push(PtrVal {
                key: Some(time::format_key(t)),
                val: if v.is_null() { None } else { Some(v.clone()) },
                included: true,
            });
        }
        t += 1_000_000_000;
        out.push(PtrVal {
            key: Some(time::format_key(t)),
            val: Some(json!("29")),
            included: false,
        });
        out
    }

    fn run(name: &str, input: &[PtrVal]) -> Value {
        let mut r = build(name).unwrap_or_else(|| panic!("no reducer {name}"));
        for pv in input {
            r.feed(pv);
        }
        r.finish()
    }

    fn law_input() -> Vec<Value> {
        vec![
            json!("31"),
            json!("63"),
            json!("foo"),
            json!("17"),
            json!({"key": "value1"}),
            json!({"key": "value2"}),
            json!({"key": "value3"}),
        ]
    }

    #[test]
    fn reducer_laws() {
        let input = stream(&law_input());
        let cases = [
            ("any", json!("31")),
            ("count", json!(7)),
            ("sum", json!(111)),
            ("sumsq", json!(5219)),
            ("max", json!(63)),
            ("min", json!(17)),
            ("avg", json!(37)),
            ("c_min", json!(-23)),
            ("c_avg", json!(4)),
            ("c_max", json!(32)),
            (
                "identity",
                json!([
                    "31",
                    "63",
                    "foo",
                    "17",
                    {"key": "value1"},
                    {"key": "value2"},
                    {"key": "value3"}
                ]),
            ),
            ("distinct", json!(["17", "31", "63", "foo"])),
            ("obj_keys", json!(["key", "key", "key"])),
            ("obj_distinct_keys", json!(["key"])),
        ];

        for (name, expected) in cases {
            assert_eq!(run(name, &input), expected, "reducer {name}");
        }
    }

    #[test]
    fn reducer_laws_on_empty_input() {
        let input = stream(&[]);
        let cases = [
            ("any", Value::Null),
            ("count", json!(0)),
            ("sum", json!(0)),
            ("sumsq", json!(0)),
            ("max", Value::Null),
            ("min", Value::Null),
            ("avg", Value::Null),
            ("c", json!(0)),
            ("c_min", Value::Null),
            ("c_avg", Value::Null),
            ("c_max", Value::Null),
            ("identity", json!([])),
            ("distinct", json!([])),
            ("obj_keys", json!([])),
            ("obj_distinct_keys", json!([])),
        ];

        for (name, expected) in cases {
            assert_eq!(run(name, &input), expected, "reducer {name}");
        }
    }

    #[test]
    fn reducer_laws_on_a_lone_null() {
        let input = stream(&[Value::Null]);
        let cases = [
            ("any", Value::Null),
            ("count", json!(0)),
            ("sum", json!(0)),
            ("sumsq", json!(0)),
            ("max", Value::Null),
            ("min", Value::Null),
            ("avg", Value::Null),
            ("c_min", Value::Null),
            ("c_avg", Value::Null),
            ("c_max", Value::Null),
            ("identity", json!([null])),
            ("obj_keys", json!([])),
        ];

        for (name, expected) in cases {
            assert_eq!(run(name, &input), expected, "reducer {name}");
        }
    }

    #[test]
    fn rate_pair_with_peek_closes_the_interval() {
        let t0 = BASE_NS;
        let input = vec![
            PtrVal {
                key: Some(time::format_key(t0)),
                val: Some(json!("20")),
                included: true,
            },
            PtrVal {
                key: Some(time::format_key(t0 + 5_000_000_000)),
                val: Some(json!("25")),
                included: false,
            },
        ];
        assert_eq!(run("c_max", &input), json!(1));
    }

    #[test]
    fn rate_needs_two_usable_samples() {
        let t0 = BASE_NS;
        let lone = vec![PtrVal {
            key: Some(time::format_key(t0)),
            val: Some(json!("29")),
            included: true,
        }];
        assert_eq!(run("c_max", &lone), Value::Null);
        assert_eq!(run("c", &lone), json!(0));
    }

    #[test]
    fn unknown_reducers_do_not_build() {
        assert!(build("median").is_none());
        assert!(is_valid("sum"));
        assert!(!is_valid(""));
    }
}
