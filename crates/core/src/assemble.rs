//! Input assembly: turns a list of mappings plus named arguments into one argument
//! mapping per invocation.
//!
//! ## Rules
//!
//! - A named argument is **parallel** when it holds a sequence and **broadcast** when it
//!   holds a scalar. `data`, when non-empty, is a parallel source too.
//! - Every parallel source must have the same length `L`; with no parallel sources
//!   `L = 1`.
//! - Record `i` is layered as `data[i]`, then each parallel argument's `i`-th element,
//!   then each broadcast value. Later layers overwrite earlier keys, so broadcast beats
//!   parallel beats `data`.
//! - Every record carries its zero-based position under [`INDEX_KEY`]. Index correlation
//!   between input and output, and resume replay, both depend on it.

use serde_json::Value as JsonValue;

use crate::error::{CoreError, CoreResult};

/// One invocation's argument mapping.
pub type Args = serde_json::Map<String, JsonValue>;

/// Reserved key holding a record's position in the assembled stream.
pub const INDEX_KEY: &str = "__index__";

/// A named argument, zipped positionally or applied to every record.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Parallel(Vec<JsonValue>),
    Broadcast(JsonValue),
}

impl ArgValue {
    pub fn is_parallel(&self) -> bool {
        matches!(self, ArgValue::Parallel(_))
    }
}

impl From<JsonValue> for ArgValue {
    /// JSON arrays are parallel; everything else is broadcast.
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => ArgValue::Parallel(items),
            other => ArgValue::Broadcast(other),
        }
    }
}

/// Caller arguments for one run, before assembly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    data: Vec<Args>,
    args: Vec<(String, ArgValue)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the list-of-mappings source.
    pub fn data(mut self, data: Vec<Args>) -> Self {
        self.data = data;
        self
    }

    /// Set the list-of-mappings source from JSON values; each must be an object.
    pub fn data_values(self, values: impl IntoIterator<Item = JsonValue>) -> CoreResult<Self> {
        let data = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                JsonValue::Object(map) => Ok(map),
                other => Err(CoreError::validation(format!(
                    "data[{i}] must be an object, got {}",
                    json_kind(&other)
                ))),
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(self.data(data))
    }

    /// Add a named argument, classified by shape (arrays are parallel).
    pub fn arg(self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.with_arg(name.into(), ArgValue::from(value.into()))
    }

    /// Add a named argument applied unchanged to every record, even if it is an array.
    pub fn broadcast(self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.with_arg(name.into(), ArgValue::Broadcast(value.into()))
    }

    /// Add a named argument zipped positionally into the records.
    pub fn parallel<V>(self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<JsonValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.with_arg(name.into(), ArgValue::Parallel(values))
    }

    fn with_arg(mut self, name: String, value: ArgValue) -> Self {
        match self.args.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.args.push((name, value)),
        }
        self
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn named_args(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.args.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Assemble the ordered per-record argument mappings.
pub fn assemble(inputs: &Inputs) -> CoreResult<Vec<Args>> {
    let mut sources: Vec<(&str, usize)> = Vec::new();
    if !inputs.data.is_empty() {
        sources.push(("data", inputs.data.len()));
    }
    for (name, value) in &inputs.args {
        if name == INDEX_KEY {
            return Err(CoreError::validation(format!(
                "argument name '{INDEX_KEY}' is reserved"
            )));
        }
        if let ArgValue::Parallel(values) = value {
            sources.push((name.as_str(), values.len()));
        }
    }

    let len = match sources.first() {
        Some(&(_, first_len)) => {
            if let Some(&(name, other_len)) = sources.iter().find(|(_, l)| *l != first_len) {
                return Err(CoreError::validation(format!(
                    "parallel sources must have equal length: '{}' has {}, '{}' has {}",
                    sources[0].0, first_len, name, other_len
                )));
            }
            first_len
        }
        None => 1,
    };

    let mut records = Vec::with_capacity(len);
    for i in 0..len {
        let mut record = match inputs.data.get(i) {
            Some(row) => {
                if row.contains_key(INDEX_KEY) {
                    return Err(CoreError::validation(format!(
                        "data[{i}] uses the reserved key '{INDEX_KEY}'"
                    )));
                }
                row.clone()
            }
            None => Args::new(),
        };

        for (name, value) in &inputs.args {
            if let ArgValue::Parallel(values) = value {
                record.insert(name.clone(), values[i].clone());
            }
        }
        for (name, value) in &inputs.args {
            if let ArgValue::Broadcast(value) = value {
                record.insert(name.clone(), value.clone());
            }
        }

        record.insert(INDEX_KEY.to_string(), JsonValue::from(i as u64));
        records.push(record);
    }

    Ok(records)
}

/// Position stored under [`INDEX_KEY`], if any.
pub fn record_index(record: &Args) -> Option<usize> {
    record
        .get(INDEX_KEY)
        .and_then(JsonValue::as_u64)
        .map(|i| i as usize)
}

/// Remove the index key; the unit of work never sees it.
pub fn strip_index(mut record: Args) -> Args {
    record.remove(INDEX_KEY);
    record
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(value: JsonValue) -> Args {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn broadcast_overrides_parallel_and_data() {
        let inputs = Inputs::new()
            .data(vec![obj(json!({"city": "Berlin"}))])
            .arg("region", json!(["DE"]))
            .arg("city", "Beijing");

        let records = assemble(&inputs).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            strip_index(records[0].clone()),
            obj(json!({"city": "Beijing", "region": "DE"}))
        );
        assert_eq!(record_index(&records[0]), Some(0));
    }

    #[test]
    fn parallel_overrides_data() {
        let inputs = Inputs::new()
            .data(vec![obj(json!({"x": 1})), obj(json!({"x": 2}))])
            .parallel("x", [10, 20]);

        let records = assemble(&inputs).unwrap();
        assert_eq!(records[0]["x"], json!(10));
        assert_eq!(records[1]["x"], json!(20));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let inputs = Inputs::new()
            .data(vec![obj(json!({"x": 1})), obj(json!({"x": 2}))])
            .arg("y", json!([1, 2, 3]));

        let err = assemble(&inputs).unwrap_err();
        match err {
            CoreError::Validation(msg) => {
                assert!(msg.contains("'data' has 2"));
                assert!(msg.contains("'y' has 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn only_broadcast_args_yield_one_record() {
        let inputs = Inputs::new().arg("n", 3).arg("topic", "rust");
        let records = assemble(&inputs).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["n"], json!(3));
        assert_eq!(records[0][INDEX_KEY], json!(0));
    }

    #[test]
    fn empty_parallel_source_yields_no_records() {
        let inputs = Inputs::new().parallel("x", Vec::<i64>::new());
        assert!(assemble(&inputs).unwrap().is_empty());
    }

    #[test]
    fn explicit_broadcast_keeps_arrays_whole() {
        let inputs = Inputs::new()
            .parallel("x", [1, 2])
            .broadcast("tags", json!(["a", "b"]));
        let records = assemble(&inputs).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["tags"], json!(["a", "b"]));
    }

    #[test]
    fn reserved_index_key_is_rejected() {
        let inputs = Inputs::new().arg(INDEX_KEY, 1);
        assert!(assemble(&inputs).is_err());

        let inputs = Inputs::new().data(vec![obj(json!({INDEX_KEY: 7}))]);
        assert!(assemble(&inputs).is_err());
    }

    #[test]
    fn data_values_rejects_non_objects() {
        let err = Inputs::new().data_values(vec![json!({"x": 1}), json!(2)]).unwrap_err();
        assert_eq!(err, CoreError::validation("data[1] must be an object, got number"));
    }

    #[test]
    fn repeated_arg_replaces_previous_value() {
        let inputs = Inputs::new().arg("n", 1).arg("n", 2);
        assert_eq!(inputs.named_args().count(), 1);
        assert_eq!(assemble(&inputs).unwrap()[0]["n"], json!(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: every record is indexed by its position and the stream has the
        /// common length of the parallel sources.
        #[test]
        fn length_and_index_invariant(
            len in 0usize..40,
            with_data in any::<bool>(),
            broadcast in any::<i64>(),
        ) {
            let mut inputs = Inputs::new()
                .parallel("p", (0..len).map(|i| i as i64))
                .arg("b", broadcast);
            if with_data {
                let rows = (0..len).map(|i| obj(json!({"d": i, "b": "from-data"}))).collect();
                inputs = inputs.data(rows);
            }

            let records = assemble(&inputs).unwrap();
            prop_assert_eq!(records.len(), len);
            for (i, record) in records.iter().enumerate() {
                prop_assert_eq!(record_index(record), Some(i));
                prop_assert_eq!(&record["p"], &json!(i as i64));
                prop_assert_eq!(&record["b"], &json!(broadcast));
            }
        }

        /// Property: any pair of unequal parallel lengths is rejected.
        #[test]
        fn unequal_lengths_always_fail(a in 0usize..20, b in 0usize..20) {
            prop_assume!(a != b);
            let inputs = Inputs::new()
                .parallel("a", (0..a).map(|i| i as i64))
                .parallel("b", (0..b).map(|i| i as i64));
            prop_assert!(assemble(&inputs).is_err());
        }
    }
}
