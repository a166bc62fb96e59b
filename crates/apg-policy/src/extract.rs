// SPDX-License-Identifier: MIT OR Apache-2.0
//! Amount extraction from actions.

use apg_core::{Action, AmountCaps};
use serde_json::Value;

/// The numeric amount an action moves, if any.
///
/// `action.amount` wins; otherwise the configured dot paths are searched in
/// order inside `action.params`.
#[must_use]
pub fn extract_amount(action: &Action, caps: &AmountCaps) -> Option<f64> {
    if let Some(amount) = action.amount {
        return Some(amount);
    }
    let params = Value::Object(action.params.clone());
    caps.param_paths
        .iter()
        .find_map(|path| lookup_path(&params, path).and_then(as_number))
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // Amounts frequently arrive as strings from form-ish callers.
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
