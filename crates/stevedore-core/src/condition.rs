//! The `when` expression language.
//!
//! Small hand-written recursive-descent parser over boolean comparisons of
//! step references (`{{steps.x.out}}`, `{{steps.x.exitCode}}`) against
//! integer or quoted string literals, combined with `&&`, `||`, `!` and
//! parentheses. No scripting runtime involved.

use crate::error::{Error, Result};
use crate::model::StepOutputs;
use crate::template::{parse_token, Token as TemplateToken};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Int(i64),
    Str(String),
    OutputRef { node: String, output: String },
    ExitCodeRef { node: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Int(i64),
    Str(String),
    OutputRef { node: String, output: String },
    ExitCodeRef { node: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
}

/// A parsed `when` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    expr: Expr,
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::Conditional(detail.into())
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

fn lex(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(malformed("single '&'; did you mean '&&'?"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(malformed("single '|'; did you mean '||'?"));
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(malformed("single '='; did you mean '=='?"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(malformed(format!("unterminated string starting at byte {i}")));
                }
                tokens.push(Token::Str(input[start..j].to_string()));
                i = j + 1;
            }
            '{' => {
                if bytes.get(i + 1) != Some(&b'{') {
                    return Err(malformed("single '{'; references use '{{steps.x.y}}'"));
                }
                let rest = &input[i + 2..];
                let end = rest
                    .find("}}")
                    .ok_or_else(|| malformed("unterminated '{{' reference"))?;
                let body = rest[..end].trim();
                match parse_token(body) {
                    Some(TemplateToken::StepOutput { node, output }) => {
                        tokens.push(Token::OutputRef { node, output });
                    }
                    Some(TemplateToken::StepExitCode { node }) => {
                        tokens.push(Token::ExitCodeRef { node });
                    }
                    _ => {
                        return Err(malformed(format!(
                            "'{{{{{body}}}}}' is not a step reference"
                        )));
                    }
                }
                i += 2 + end + 2;
            }
            '-' | '0'..='9' => {
                let start = i;
                let mut j = i;
                if bytes[j] as char == '-' {
                    j += 1;
                }
                while j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                    j += 1;
                }
                let text = &input[start..j];
                let value: i64 = text
                    .parse()
                    .map_err(|_| malformed(format!("invalid integer literal '{text}'")))?;
                tokens.push(Token::Int(value));
                i = j;
            }
            other => {
                return Err(malformed(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_factor()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                let inner = self.parse_factor()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(malformed("missing closing ')'")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            other => {
                return Err(malformed(format!(
                    "expected comparison operator, found {other:?}"
                )))
            }
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Cmp { op, lhs, rhs })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Operand::Int(v)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::OutputRef { node, output }) => Ok(Operand::OutputRef { node, output }),
            Some(Token::ExitCodeRef { node }) => Ok(Operand::ExitCodeRef { node }),
            other => Err(malformed(format!("expected operand, found {other:?}"))),
        }
    }
}

/// Parse a `when` expression without evaluating it.
pub fn parse(input: &str) -> Result<Cond> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(malformed("empty expression"));
    }
    let tokens = lex(trimmed)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(malformed(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(Cond { expr })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Str(String),
}

impl Cond {
    /// Step names this expression reads.
    pub fn referenced_steps(&self) -> Vec<String> {
        let mut steps = Vec::new();
        collect_steps(&self.expr, &mut steps);
        steps
    }

    /// Evaluate against the published step outputs.
    ///
    /// A reference to a skipped step makes the whole expression false, so
    /// dependents of skipped nodes skip rather than fail.
    pub fn evaluate(&self, outputs: &StepOutputs) -> Result<bool> {
        for step in self.referenced_steps() {
            if outputs.is_skipped(&step) {
                return Ok(false);
            }
        }
        eval_expr(&self.expr, outputs)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(input: &str, outputs: &StepOutputs) -> Result<bool> {
    parse(input)?.evaluate(outputs)
}

fn collect_steps(expr: &Expr, steps: &mut Vec<String>) {
    let mut push = |node: &String| {
        if !steps.contains(node) {
            steps.push(node.clone());
        }
    };
    match expr {
        Expr::Or(a, b) | Expr::And(a, b) => {
            collect_steps(a, steps);
            collect_steps(b, steps);
        }
        Expr::Not(inner) => collect_steps(inner, steps),
        Expr::Cmp { lhs, rhs, .. } => {
            for operand in [lhs, rhs] {
                match operand {
                    Operand::OutputRef { node, .. } | Operand::ExitCodeRef { node } => push(node),
                    _ => {}
                }
            }
        }
    }
}

fn eval_expr(expr: &Expr, outputs: &StepOutputs) -> Result<bool> {
    match expr {
        Expr::Or(a, b) => Ok(eval_expr(a, outputs)? || eval_expr(b, outputs)?),
        Expr::And(a, b) => Ok(eval_expr(a, outputs)? && eval_expr(b, outputs)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, outputs)?),
        Expr::Cmp { op, lhs, rhs } => {
            let lhs = resolve(lhs, outputs)?;
            let rhs = resolve(rhs, outputs)?;
            compare(*op, &lhs, &rhs)
        }
    }
}

fn resolve(operand: &Operand, outputs: &StepOutputs) -> Result<Value> {
    match operand {
        Operand::Int(v) => Ok(Value::Int(*v)),
        Operand::Str(s) => Ok(Value::Str(s.clone())),
        Operand::OutputRef { node, output } => {
            if !outputs.has_terminated(node) {
                return Err(malformed(format!(
                    "references step '{node}' which has not terminated"
                )));
            }
            // Unpublished outputs read as the empty string.
            Ok(Value::Str(
                outputs.output(node, output).unwrap_or_default().to_string(),
            ))
        }
        Operand::ExitCodeRef { node } => match outputs.exit_code(node) {
            Some(code) => Ok(Value::Int(code)),
            None => Err(malformed(format!(
                "references step '{node}' which has not terminated"
            ))),
        },
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Str(s) => s.trim().parse().ok(),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (as_int(lhs), as_int(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => value_text(lhs) == value_text(rhs),
            };
            Ok(if op == CmpOp::Eq { equal } else { !equal })
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let a = as_int(lhs).ok_or_else(|| {
                malformed(format!("'{}' is not an integer", value_text(lhs)))
            })?;
            let b = as_int(rhs).ok_or_else(|| {
                malformed(format!("'{}' is not an integer", value_text(rhs)))
            })?;
            Ok(match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Str(s) => s.clone(),
    }
}
