//! Condition evaluation for conditional and loop steps.
//!
//! Two shapes, classified at parse time by `studio_types::condition::Condition`:
//!
//! - **Legacy** expression strings. Template references are substituted as
//!   quoted string literals, then the string is parsed by a small
//!   recursive-descent parser. Accepted grammar (documented subset):
//!   string literals (single or double quoted), decimal numbers,
//!   `true`/`false`, `=== !== == != < <= > >= && || !`, and parentheses.
//!   Anything else is `ConditionError::UnexpectedToken` -- unknown tokens are
//!   rejected, never coerced.
//! - **Structured v2.0** rule trees. Groups compose with AND/OR and
//!   short-circuit; every evaluated rule lands in the trace. Coercion
//!   failures (non-numeric input for a number rule, invalid regex) produce
//!   `matched = false` trace entries, never an error.
//!
//! Both shapes return `ConditionOutcome { result, trace }`.

use std::collections::HashMap;

use studio_types::condition::{
    Combinator, Condition, ConditionOutcome, Rule, RuleDataType, RuleGroup, RuleOperation,
    StructuredCondition, TraceEntry,
};
use studio_types::workflow::StepStatus;
use thiserror::Error;

use super::template::{self, TemplateContext};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or evaluating a condition.
#[derive(Debug, Error)]
pub enum ConditionError {
    /// A token outside the documented legacy grammar.
    #[error("unexpected token at offset {offset}: '{token}'")]
    UnexpectedToken { offset: usize, token: String },

    /// The expression ended mid-production.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Trailing input after a complete expression.
    #[error("trailing input after expression: '{0}'")]
    TrailingInput(String),

    /// Structured condition with an unsupported version.
    #[error("unsupported condition version '{0}' (expected \"2.0\")")]
    UnsupportedVersion(String),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Evaluate a condition against the thread's current outputs and statuses.
pub fn evaluate(
    condition: &Condition,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
    ctx: &TemplateContext,
) -> Result<ConditionOutcome, ConditionError> {
    match condition {
        Condition::Legacy(expr) => evaluate_legacy(expr, step_outputs, step_status, ctx),
        Condition::Structured(tree) => evaluate_structured(tree, step_outputs, step_status),
    }
}

// ---------------------------------------------------------------------------
// Legacy expressions
// ---------------------------------------------------------------------------

/// Evaluate a legacy expression string.
pub fn evaluate_legacy(
    expression: &str,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
    ctx: &TemplateContext,
) -> Result<ConditionOutcome, ConditionError> {
    let substituted = substitute_quoted(expression, step_outputs, step_status, ctx);
    let tokens = lex(&substituted)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        let trailing = &parser.tokens[parser.pos];
        return Err(ConditionError::TrailingInput(format!(
            "{:?} at offset {}",
            trailing.kind, trailing.offset
        )));
    }

    let mut trace = Vec::new();
    let value = eval_expr(&expr, &mut trace);
    Ok(ConditionOutcome { result: truthy(&value), trace })
}

/// Substitute template references as quoted string literals so the parser
/// only ever sees literals. Unknown references stay as-is and are rejected
/// by the lexer.
fn substitute_quoted(
    expression: &str,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
    ctx: &TemplateContext,
) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('}') else {
            out.push_str(after);
            return out;
        };
        let token = &after[1..close];
        // Resolve exactly one token through the template resolver; a literal
        // passthrough means the reference is unknown.
        let resolved = template::resolve(&format!("{{{token}}}"), step_outputs, step_status, ctx);
        if resolved == format!("{{{token}}}") {
            out.push_str(&after[..=close]);
        } else {
            out.push('"');
            out.push_str(&resolved.replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

// -- Lexer --

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Str(String),
    Num(f64),
    Bool(bool),
    StrictEq,
    StrictNe,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    AndAnd,
    OrOr,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn lex(input: &str) -> Result<Vec<Token>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: i });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: i });
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(ConditionError::UnexpectedEnd);
                    }
                    let ch = bytes[i] as char;
                    if ch == '\\' && i + 1 < bytes.len() {
                        value.push(bytes[i + 1] as char);
                        i += 2;
                    } else if ch == quote {
                        i += 1;
                        break;
                    } else {
                        // Multibyte chars are copied byte-exact via str slicing.
                        let len = utf8_len(bytes[i]);
                        value.push_str(&input[i..i + len]);
                        i += len;
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(value), offset: start });
            }
            '=' => {
                if input[i..].starts_with("===") {
                    tokens.push(Token { kind: TokenKind::StrictEq, offset: i });
                    i += 3;
                } else if input[i..].starts_with("==") {
                    tokens.push(Token { kind: TokenKind::Eq, offset: i });
                    i += 2;
                } else {
                    return Err(unexpected(input, i));
                }
            }
            '!' => {
                if input[i..].starts_with("!==") {
                    tokens.push(Token { kind: TokenKind::StrictNe, offset: i });
                    i += 3;
                } else if input[i..].starts_with("!=") {
                    tokens.push(Token { kind: TokenKind::Ne, offset: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Not, offset: i });
                    i += 1;
                }
            }
            '<' => {
                if input[i..].starts_with("<=") {
                    tokens.push(Token { kind: TokenKind::Le, offset: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, offset: i });
                    i += 1;
                }
            }
            '>' => {
                if input[i..].starts_with(">=") {
                    tokens.push(Token { kind: TokenKind::Ge, offset: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, offset: i });
                    i += 1;
                }
            }
            '&' => {
                if input[i..].starts_with("&&") {
                    tokens.push(Token { kind: TokenKind::AndAnd, offset: i });
                    i += 2;
                } else {
                    return Err(unexpected(input, i));
                }
            }
            '|' => {
                if input[i..].starts_with("||") {
                    tokens.push(Token { kind: TokenKind::OrOr, offset: i });
                    i += 2;
                } else {
                    return Err(unexpected(input, i));
                }
            }
            '0'..='9' | '-' | '+' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let num: f64 = text
                    .parse()
                    .map_err(|_| unexpected(input, start))?;
                tokens.push(Token { kind: TokenKind::Num(num), offset: start });
            }
            _ if c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                match &input[start..i] {
                    "true" => tokens.push(Token { kind: TokenKind::Bool(true), offset: start }),
                    "false" => tokens.push(Token { kind: TokenKind::Bool(false), offset: start }),
                    // Bare identifiers are outside the grammar.
                    _ => return Err(unexpected(input, start)),
                }
            }
            _ => return Err(unexpected(input, i)),
        }
    }

    Ok(tokens)
}

fn unexpected(input: &str, offset: usize) -> ConditionError {
    let token: String = input[offset..].chars().take(12).collect();
    ConditionError::UnexpectedToken { offset, token }
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// -- Parser --

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug)]
enum Expr {
    Lit(Value),
    Not(Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    StrictEq,
    StrictNe,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let kind = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if kind.is_some() {
            self.pos += 1;
        }
        kind
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(TokenKind::StrictEq) => CmpOp::StrictEq,
            Some(TokenKind::StrictNe) => CmpOp::StrictNe,
            Some(TokenKind::Eq) => CmpOp::Eq,
            Some(TokenKind::Ne) => CmpOp::Ne,
            Some(TokenKind::Lt) => CmpOp::Lt,
            Some(TokenKind::Le) => CmpOp::Le,
            Some(TokenKind::Gt) => CmpOp::Gt,
            Some(TokenKind::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(TokenKind::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.advance() {
            Some(TokenKind::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(TokenKind::Num(n)) => Ok(Expr::Lit(Value::Num(n))),
            Some(TokenKind::Bool(b)) => Ok(Expr::Lit(Value::Bool(b))),
            Some(TokenKind::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(TokenKind::RParen) => Ok(inner),
                    Some(other) => Err(ConditionError::UnexpectedToken {
                        offset: 0,
                        token: format!("{other:?}"),
                    }),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ConditionError::UnexpectedToken {
                offset: 0,
                token: format!("{other:?}"),
            }),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

// -- Evaluation --

fn eval_expr(expr: &Expr, trace: &mut Vec<TraceEntry>) -> Value {
    match expr {
        Expr::Lit(v) => v.clone(),
        Expr::Not(inner) => Value::Bool(!truthy(&eval_expr(inner, trace))),
        Expr::And(l, r) => {
            if !truthy(&eval_expr(l, trace)) {
                Value::Bool(false)
            } else {
                Value::Bool(truthy(&eval_expr(r, trace)))
            }
        }
        Expr::Or(l, r) => {
            if truthy(&eval_expr(l, trace)) {
                Value::Bool(true)
            } else {
                Value::Bool(truthy(&eval_expr(r, trace)))
            }
        }
        Expr::Cmp(l, op, r) => {
            let left = eval_expr(l, trace);
            let right = eval_expr(r, trace);
            let matched = compare(&left, *op, &right);
            trace.push(TraceEntry {
                rule: format!("{op:?}"),
                left: display(&left),
                right: display(&right),
                matched,
            });
            Value::Bool(matched)
        }
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::StrictEq => left == right,
        CmpOp::StrictNe => left != right,
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::Ne => !loose_eq(left, right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => match (as_num(left), as_num(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            match ordering {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                // Incomparable operands evaluate false rather than erroring.
                None => false,
            }
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_num(left), as_num(right)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_num(value: &Value) -> Option<f64> {
    match value {
        Value::Num(n) => Some(*n),
        Value::Str(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Num(n) => *n != 0.0,
        Value::Str(s) => !s.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Num(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Structured v2.0 rule trees
// ---------------------------------------------------------------------------

/// Evaluate a structured condition tree.
pub fn evaluate_structured(
    tree: &StructuredCondition,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
) -> Result<ConditionOutcome, ConditionError> {
    if tree.version != "2.0" {
        return Err(ConditionError::UnsupportedVersion(tree.version.clone()));
    }
    let mut trace = Vec::new();
    let result = eval_group(&tree.root_group, step_outputs, step_status, &mut trace);
    Ok(ConditionOutcome { result, trace })
}

/// Evaluate a group with short-circuiting. An empty AND group is vacuously
/// true; an empty OR group is false.
fn eval_group(
    group: &RuleGroup,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
    trace: &mut Vec<TraceEntry>,
) -> bool {
    match group.combinator {
        Combinator::And => {
            for rule in &group.rules {
                if !eval_rule(rule, step_outputs, step_status, trace) {
                    return false;
                }
            }
            for nested in &group.groups {
                if !eval_group(nested, step_outputs, step_status, trace) {
                    return false;
                }
            }
            true
        }
        Combinator::Or => {
            for rule in &group.rules {
                if eval_rule(rule, step_outputs, step_status, trace) {
                    return true;
                }
            }
            for nested in &group.groups {
                if eval_group(nested, step_outputs, step_status, trace) {
                    return true;
                }
            }
            false
        }
    }
}

fn eval_rule(
    rule: &Rule,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
    trace: &mut Vec<TraceEntry>,
) -> bool {
    let left = left_operand(rule, step_outputs, step_status);
    let right = rule
        .right_value
        .as_ref()
        .map(|r| value_as_string(&r.value))
        .unwrap_or_default();

    let matched = match rule.operation {
        RuleOperation::IsEmpty => left.is_empty(),
        RuleOperation::IsNotEmpty => !left.is_empty(),
        RuleOperation::Contains => left.contains(&right),
        RuleOperation::StartsWith => left.starts_with(&right),
        RuleOperation::EndsWith => left.ends_with(&right),
        RuleOperation::MatchesRegex => match regex::Regex::new(&right) {
            Ok(re) => re.is_match(&left),
            Err(_) => false,
        },
        RuleOperation::Equals
        | RuleOperation::NotEquals
        | RuleOperation::GreaterThan
        | RuleOperation::LessThan => typed_compare(rule, &left, &right),
    };

    trace.push(TraceEntry {
        rule: format!(
            "{}.{} {:?}",
            rule.left_value.step_id, rule.left_value.field, rule.operation
        ),
        left,
        right,
        matched,
    });
    matched
}

fn typed_compare(rule: &Rule, left: &str, right: &str) -> bool {
    match rule.data_type {
        RuleDataType::String => match rule.operation {
            RuleOperation::Equals => left == right,
            RuleOperation::NotEquals => left != right,
            RuleOperation::GreaterThan => left > right,
            RuleOperation::LessThan => left < right,
            _ => false,
        },
        RuleDataType::Number => {
            let (Ok(l), Ok(r)) = (left.trim().parse::<f64>(), right.trim().parse::<f64>()) else {
                // Coercion failure: the rule fails, recorded in the trace.
                return false;
            };
            match rule.operation {
                RuleOperation::Equals => l == r,
                RuleOperation::NotEquals => l != r,
                RuleOperation::GreaterThan => l > r,
                RuleOperation::LessThan => l < r,
                _ => false,
            }
        }
        RuleDataType::Boolean => {
            let parse = |s: &str| match s.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            };
            let (Some(l), Some(r)) = (parse(left), parse(right)) else {
                return false;
            };
            match rule.operation {
                RuleOperation::Equals => l == r,
                RuleOperation::NotEquals => l != r,
                _ => false,
            }
        }
    }
}

fn left_operand(
    rule: &Rule,
    step_outputs: &HashMap<String, String>,
    step_status: &HashMap<String, StepStatus>,
) -> String {
    let step_id = &rule.left_value.step_id;
    match rule.left_value.field.as_str() {
        "status" => step_status
            .get(step_id)
            .and_then(|s| serde_json::to_value(s).ok())
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default(),
        // `output` / `response` and anything else read the output text.
        _ => step_outputs.get(step_id).cloned().unwrap_or_default(),
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
