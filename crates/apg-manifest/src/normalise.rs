// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy field normalisation.
//!
//! Manifests arrive in one of two naming conventions: the manifest schema
//! (`tool_allowlist`, `jurisdiction_allowlist`, currency-keyed
//! `amount_caps`) or the engine-native names (`allowed_tools`,
//! `allowed_jurisdictions`, structured `amount_caps`). Both are accepted;
//! engine-native names win when a document carries both. Downstream code
//! only ever sees [`PolicyConfig`].

use apg_core::{AmountCaps, ApprovalThresholds, Budgets, PolicyConfig};
use serde_json::Value;

/// Normalise a raw policy document into a [`PolicyConfig`].
#[must_use]
pub fn normalise_policy(policy: &Value) -> PolicyConfig {
    let Some(obj) = policy.as_object() else {
        return PolicyConfig::default();
    };

    let counterparty = obj.get("counterparty").and_then(Value::as_object);

    PolicyConfig {
        allowed_action_types: string_list(obj.get("allowed_action_types")),
        allowed_tools: first_list(obj.get("allowed_tools"), obj.get("tool_allowlist")),
        denied_tools: first_list(obj.get("denied_tools"), obj.get("tool_denylist")),
        allowed_jurisdictions: first_list(
            obj.get("allowed_jurisdictions"),
            obj.get("jurisdiction_allowlist"),
        ),
        counterparty_allowlist: first_list(
            counterparty.and_then(|c| c.get("allowlist")),
            obj.get("counterparty_allowlist"),
        ),
        counterparty_denylist: first_list(
            counterparty.and_then(|c| c.get("denylist")),
            obj.get("counterparty_denylist"),
        ),
        amount_caps: amount_caps(obj.get("amount_caps")),
        approval_thresholds: approval_thresholds(obj.get("approval_thresholds")),
        budgets: budgets(obj.get("budgets")),
        require_capability_token: obj
            .get("require_capability_token")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Engine-native value when present, else the legacy one.
fn first_list(native: Option<&Value>, legacy: Option<&Value>) -> Vec<String> {
    if native.is_some_and(Value::is_array) {
        string_list(native)
    } else {
        string_list(legacy)
    }
}

fn amount_caps(value: Option<&Value>) -> AmountCaps {
    let Some(obj) = value.and_then(Value::as_object) else {
        return AmountCaps::default();
    };

    let is_native = obj.contains_key("max_amount")
        || obj.contains_key("escalate_above")
        || obj.contains_key("param_paths")
        || obj.contains_key("currency_field");

    if is_native {
        return AmountCaps {
            max_amount: obj.get("max_amount").and_then(Value::as_f64),
            escalate_above: obj.get("escalate_above").and_then(Value::as_f64),
            param_paths: string_list(obj.get("param_paths")),
            currency_field: obj
                .get("currency_field")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
    }

    // Legacy shape: a currency → cap mapping. The normalised cap is the
    // largest configured value; amounts are looked up under the historical
    // param names.
    let max = obj
        .values()
        .filter_map(Value::as_f64)
        .fold(None, |acc: Option<f64>, n| {
            Some(acc.map_or(n, |a| a.max(n)))
        });
    if max.is_none() {
        return AmountCaps::default();
    }
    AmountCaps {
        max_amount: max,
        escalate_above: None,
        param_paths: vec!["amount".into(), "value".into(), "total".into()],
        currency_field: Some("currency".into()),
    }
}

fn approval_thresholds(value: Option<&Value>) -> ApprovalThresholds {
    let Some(obj) = value.and_then(Value::as_object) else {
        return ApprovalThresholds::default();
    };
    ApprovalThresholds {
        amount: obj.get("amount").and_then(Value::as_f64),
        action_types: string_list(obj.get("action_types")),
        tools: string_list(obj.get("tools")),
    }
}

fn budgets(value: Option<&Value>) -> Budgets {
    let Some(obj) = value.and_then(Value::as_object) else {
        return Budgets::default();
    };
    Budgets {
        daily_cap: obj.get("daily_cap").and_then(Value::as_u64),
        escalate_percent: obj.get("escalate_percent").and_then(Value::as_f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_names_pass_through() {
        let policy = json!({
            "allowed_action_types": ["email"],
            "allowed_tools": ["send_email"],
            "denied_tools": ["rm_rf"],
            "allowed_jurisdictions": ["DE", "FR"],
            "counterparty": {"allowlist": ["acme.com"], "denylist": ["evil.com"]},
            "amount_caps": {"max_amount": 10000.0, "escalate_above": 5000.0, "param_paths": ["amount"]},
            "approval_thresholds": {"amount": 10000.0},
            "budgets": {"daily_cap": 100},
            "require_capability_token": true,
        });
        let cfg = normalise_policy(&policy);
        assert_eq!(cfg.allowed_tools, vec!["send_email"]);
        assert_eq!(cfg.denied_tools, vec!["rm_rf"]);
        assert_eq!(cfg.counterparty_allowlist, vec!["acme.com"]);
        assert_eq!(cfg.counterparty_denylist, vec!["evil.com"]);
        assert_eq!(cfg.amount_caps.max_amount, Some(10000.0));
        assert_eq!(cfg.amount_caps.escalate_above, Some(5000.0));
        assert_eq!(cfg.budgets.daily_cap, Some(100));
        assert!(cfg.require_capability_token);
    }

    #[test]
    fn legacy_names_are_normalised() {
        let policy = json!({
            "tool_allowlist": ["send_email"],
            "tool_denylist": ["rm_rf"],
            "jurisdiction_allowlist": ["DE"],
            "counterparty_allowlist": ["acme.com"],
            "counterparty_denylist": ["evil.com"],
        });
        let cfg = normalise_policy(&policy);
        assert_eq!(cfg.allowed_tools, vec!["send_email"]);
        assert_eq!(cfg.denied_tools, vec!["rm_rf"]);
        assert_eq!(cfg.allowed_jurisdictions, vec!["DE"]);
        assert_eq!(cfg.counterparty_allowlist, vec!["acme.com"]);
        assert_eq!(cfg.counterparty_denylist, vec!["evil.com"]);
    }

    #[test]
    fn native_wins_when_both_present() {
        let policy = json!({
            "allowed_tools": ["native_tool"],
            "tool_allowlist": ["legacy_tool"],
        });
        let cfg = normalise_policy(&policy);
        assert_eq!(cfg.allowed_tools, vec!["native_tool"]);
    }

    #[test]
    fn currency_map_amount_caps_take_the_max() {
        let policy = json!({
            "amount_caps": {"EUR": 5000.0, "USD": 8000.0, "GBP": 4000.0},
        });
        let cfg = normalise_policy(&policy);
        assert_eq!(cfg.amount_caps.max_amount, Some(8000.0));
        assert_eq!(
            cfg.amount_caps.param_paths,
            vec!["amount", "value", "total"]
        );
        assert_eq!(cfg.amount_caps.currency_field.as_deref(), Some("currency"));
    }

    #[test]
    fn empty_policy_is_unrestricted() {
        let cfg = normalise_policy(&json!({}));
        assert_eq!(cfg, PolicyConfig::default());
        let cfg = normalise_policy(&Value::Null);
        assert_eq!(cfg, PolicyConfig::default());
    }
}
