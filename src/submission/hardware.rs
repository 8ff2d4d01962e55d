use serde_json::{Map, Value};

use crate::submission::manifest::ProcessorInfo;

const FLAT_KEYS: [&str; 10] = [
    "vendor",
    "cpu_vendor",
    "model",
    "cpu_model",
    "cores",
    "cpu_cores",
    "threads",
    "cpu_threads",
    "architecture",
    "arch",
];

/// Read a count stored as a number or a numeric string
pub fn as_count(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|n| n.min(u32::MAX as u64) as u32),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn text(entry: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| entry.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

fn count(entry: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| as_count(entry.get(*k)))
}

fn normalize_entry(entry: &Map<String, Value>, index: usize) -> ProcessorInfo {
    let slot = match text(entry, &["slot", "socket", "id"]) {
        s if s.is_empty() => index.to_string(),
        s => s,
    };
    let cores = count(entry, &["cores", "cpu_cores"]).unwrap_or(0);
    let threads = count(entry, &["threads", "cpu_threads"]).unwrap_or(cores).max(cores);

    ProcessorInfo {
        slot,
        vendor: text(entry, &["vendor", "cpu_vendor"]),
        model: text(entry, &["model", "cpu_model"]),
        cores,
        threads,
        architecture: text(entry, &["architecture", "arch"]),
    }
}

/// Normalize the processors of a hardware descriptor.
///
/// A `processor` list is normalized entry by entry. Without one, a single
/// entry is synthesized from flat top-level fields. The result is empty only
/// when the descriptor carries no processor data at all.
pub fn normalize_processors(descriptor: &Value) -> Vec<ProcessorInfo> {
    let Some(object) = descriptor.as_object() else {
        return Vec::new();
    };

    if let Some(list) = object.get("processor").and_then(Value::as_array) {
        return list
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| entry.as_object().map(|e| normalize_entry(e, i)))
            .collect();
    }

    if FLAT_KEYS.iter().any(|k| object.contains_key(*k)) {
        return vec![normalize_entry(object, 0)];
    }

    Vec::new()
}
