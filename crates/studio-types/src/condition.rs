//! Condition shapes for conditional and loop steps.
//!
//! Two wire formats coexist: a legacy expression string
//! (`{check.output} === "valid"`) and the structured v2.0 rule tree produced
//! by the visual builder. The untagged serde enum classifies at parse time --
//! a JSON string is legacy, an object is structured.

use serde::{Deserialize, Serialize};

/// A branch condition in either supported shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    /// Legacy expression string, e.g. `{check.output} === "valid"`.
    Legacy(String),
    /// Structured v2.0 rule tree.
    Structured(StructuredCondition),
}

/// Structured condition document (`version` must be `"2.0"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StructuredCondition {
    pub version: String,
    pub root_group: RuleGroup,
}

/// A group of rules and nested groups combined with AND/OR.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    pub combinator: Combinator,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// A single comparison rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub left_value: LeftValue,
    pub operation: RuleOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_value: Option<RightValue>,
    pub data_type: RuleDataType,
}

/// The left operand: a field of a prior step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeftValue {
    pub step_id: String,
    /// `output`, `status`, or `response`.
    pub field: String,
}

/// The right operand: a typed literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RightValue {
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperation {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    MatchesRegex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDataType {
    String,
    Number,
    Boolean,
}

/// Result of evaluating a condition: the verdict plus a per-rule trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionOutcome {
    pub result: bool,
    pub trace: Vec<TraceEntry>,
}

/// One evaluated rule in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub rule: String,
    pub left: String,
    pub right: String,
    pub matched: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_string_classifies_as_legacy() {
        let cond: Condition =
            serde_json::from_value(json!("{check.output} === \"valid\"")).unwrap();
        assert!(matches!(cond, Condition::Legacy(_)));
    }

    #[test]
    fn structured_object_classifies_as_structured() {
        let cond: Condition = serde_json::from_value(json!({
            "version": "2.0",
            "rootGroup": {
                "combinator": "AND",
                "rules": [{
                    "leftValue": {"stepId": "check", "field": "output"},
                    "operation": "equals",
                    "rightValue": {"type": "string", "value": "valid"},
                    "dataType": "string"
                }],
                "groups": []
            }
        }))
        .unwrap();
        match cond {
            Condition::Structured(s) => {
                assert_eq!(s.version, "2.0");
                assert_eq!(s.root_group.combinator, Combinator::And);
                assert_eq!(s.root_group.rules.len(), 1);
                assert_eq!(s.root_group.rules[0].left_value.step_id, "check");
                assert_eq!(s.root_group.rules[0].operation, RuleOperation::Equals);
            }
            Condition::Legacy(_) => panic!("expected structured"),
        }
    }

    #[test]
    fn nested_groups_roundtrip() {
        let cond = StructuredCondition {
            version: "2.0".to_string(),
            root_group: RuleGroup {
                combinator: Combinator::Or,
                rules: vec![],
                groups: vec![RuleGroup {
                    combinator: Combinator::And,
                    rules: vec![Rule {
                        left_value: LeftValue {
                            step_id: "a".to_string(),
                            field: "status".to_string(),
                        },
                        operation: RuleOperation::NotEquals,
                        right_value: Some(RightValue {
                            value_type: "string".to_string(),
                            value: json!("failed"),
                        }),
                        data_type: RuleDataType::String,
                    }],
                    groups: vec![],
                }],
            },
        };
        let json = serde_json::to_string(&cond).unwrap();
        assert!(json.contains("\"combinator\":\"OR\""));
        let parsed: StructuredCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cond);
    }

    #[test]
    fn is_empty_rule_needs_no_right_value() {
        let rule: Rule = serde_json::from_value(json!({
            "leftValue": {"stepId": "a", "field": "output"},
            "operation": "isEmpty",
            "dataType": "string"
        }))
        .unwrap();
        assert_eq!(rule.operation, RuleOperation::IsEmpty);
        assert!(rule.right_value.is_none());
    }
}
