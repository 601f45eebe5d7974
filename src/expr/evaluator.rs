//! Lexer, parser and tree-walking evaluator for calc expressions
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr     := or ( '?' expr ':' expr )?
//! or       := and ( '||' and )*
//! and      := equality ( '&&' equality )*
//! equality := compare ( ( '==' | '!=' ) compare )*
//! compare  := additive ( ( '<' | '<=' | '>' | '>=' ) additive )*
//! additive := term ( ( '+' | '-' ) term )*
//! term     := unary ( ( '*' | '/' | '%' ) unary )*
//! unary    := ( '-' | '!' ) unary | primary
//! primary  := NUMBER | STRING | 'true' | 'false' | 'value'
//!           | IDENT '(' ( expr ( ',' expr )* )? ')' | '(' expr ')'
//! ```

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_SOURCE_LEN: usize = 1024;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("wrong number of arguments for {0}()")]
    Arity(String),

    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression longer than {MAX_SOURCE_LEN} characters")]
    TooLong,

    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("unterminated placeholder in template")]
    UnterminatedPlaceholder,
}

/// Result of an evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl ExprValue {
    /// Binds a JSON value to the `value` identifier
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => ExprValue::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => ExprValue::Str(s.clone()),
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Null => ExprValue::Str(String::new()),
            other => ExprValue::Str(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ExprValue::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => Value::from(*n as i64),
            ExprValue::Num(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ExprValue::Str(s) => Value::String(s.clone()),
            ExprValue::Bool(b) => Value::Bool(*b),
        }
    }

    pub fn to_number(&self) -> Result<f64, ExprError> {
        match self {
            ExprValue::Num(n) => Ok(*n),
            ExprValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            ExprValue::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(0.0);
                }
                trimmed
                    .parse::<f64>()
                    .map_err(|_| ExprError::NotANumber(s.clone()))
            }
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ExprValue::Num(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::Bool(b) => *b,
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            ExprValue::Num(n) => write!(f, "{}", n),
            ExprValue::Str(s) => write!(f, "{}", s),
            ExprValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
}

// Digits with optional fraction and exponent; returns the index after the literal
fn lex_number(chars: &[char], start: usize, tokens: &mut Vec<Token>) -> Result<usize, ExprError> {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    let number = text
        .parse::<f64>()
        .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
    tokens.push(Token::Num(number));
    Ok(i)
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' => i = lex_number(&chars, i, &mut tokens)?,
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => {
                i = lex_number(&chars, i, &mut tokens)?
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(other) => text.push(*other),
                                None => return Err(ExprError::UnterminatedString),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '=' if next == Some('=') => {
                // "===" is accepted as an alias
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                tokens.push(Token::EqEq);
            }
            '!' if next == Some('=') => {
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                tokens.push(Token::NotEq);
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Abs,
    Round,
    Floor,
    Ceil,
    Min,
    Max,
    Str,
    Num,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Func::Abs),
            "round" => Some(Func::Round),
            "floor" => Some(Func::Floor),
            "ceil" => Some(Func::Ceil),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "str" => Some(Func::Str),
            "num" => Some(Func::Num),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Round => "round",
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Min => "min",
            Func::Max => "max",
            Func::Str => "str",
            Func::Num => "num",
        }
    }

    fn accepts(self, count: usize) -> bool {
        match self {
            Func::Round => (1..=2).contains(&count),
            Func::Min | Func::Max => count >= 1,
            _ => count == 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(ExprValue),
    Value,
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken(format!("{:?}", token))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Node, ExprError> {
        self.descend()?;
        let condition = self.or()?;
        let node = if self.eat(&Token::Question) {
            let then = self.expr()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.expr()?;
            Node::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.depth -= 1;
        Ok(node)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Node, ExprError>,
        ops: &[(Token, BinaryOp)],
    ) -> Result<Node, ExprError> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    let right = next(self)?;
                    left = Node::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        self.binary_level(Self::and, &[(Token::OrOr, BinaryOp::Or)])
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        self.binary_level(Self::equality, &[(Token::AndAnd, BinaryOp::And)])
    }

    fn equality(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            Self::compare,
            &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::Ne)],
        )
    }

    fn compare(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            Self::additive,
            &[
                (Token::Le, BinaryOp::Le),
                (Token::Lt, BinaryOp::Lt),
                (Token::Ge, BinaryOp::Ge),
                (Token::Gt, BinaryOp::Gt),
            ],
        )
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            Self::term,
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        )
    }

    fn term(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            Self::unary,
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        if self.eat(&Token::Bang) {
            self.descend()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Node::Literal(ExprValue::Num(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(ExprValue::Str(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "value" => Ok(Node::Value),
                "true" => Ok(Node::Literal(ExprValue::Bool(true))),
                "false" => Ok(Node::Literal(ExprValue::Bool(false))),
                _ => {
                    let func =
                        Func::lookup(&name).ok_or(ExprError::UnknownIdentifier(name.clone()))?;
                    self.expect(&Token::LParen)?;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma)?;
                        }
                    }
                    if !func.accepts(args.len()) {
                        return Err(ExprError::Arity(func.name().to_string()));
                    }
                    Ok(Node::Call(func, args))
                }
            },
            Some(token) => Err(ExprError::UnexpectedToken(format!("{:?}", token))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// A compiled calc expression.
///
/// The only binding visible to an expression is `value`; evaluation is a pure
/// function of that input and cannot reach any other state.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        if source.chars().count() > MAX_SOURCE_LEN {
            return Err(ExprError::TooLong);
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(ExprError::UnexpectedToken(format!("{:?}", token)));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, value: &Value) -> Result<ExprValue, ExprError> {
        let bound = ExprValue::from_json(value);
        eval_node(&self.root, &bound)
    }
}

impl FromStr for Expression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

fn eval_node(node: &Node, value: &ExprValue) -> Result<ExprValue, ExprError> {
    match node {
        Node::Literal(literal) => Ok(literal.clone()),
        Node::Value => Ok(value.clone()),
        Node::Unary(UnaryOp::Neg, operand) => {
            Ok(ExprValue::Num(-eval_node(operand, value)?.to_number()?))
        }
        Node::Unary(UnaryOp::Not, operand) => {
            Ok(ExprValue::Bool(!eval_node(operand, value)?.is_truthy()))
        }
        Node::Ternary(condition, then, otherwise) => {
            if eval_node(condition, value)?.is_truthy() {
                eval_node(then, value)
            } else {
                eval_node(otherwise, value)
            }
        }
        Node::Binary(BinaryOp::And, left, right) => {
            let l = eval_node(left, value)?.is_truthy();
            Ok(ExprValue::Bool(l && eval_node(right, value)?.is_truthy()))
        }
        Node::Binary(BinaryOp::Or, left, right) => {
            let l = eval_node(left, value)?.is_truthy();
            Ok(ExprValue::Bool(l || eval_node(right, value)?.is_truthy()))
        }
        Node::Binary(op, left, right) => {
            let l = eval_node(left, value)?;
            let r = eval_node(right, value)?;
            apply_binary(*op, l, r)
        }
        Node::Call(func, args) => {
            let values = args
                .iter()
                .map(|arg| eval_node(arg, value))
                .collect::<Result<Vec<_>, _>>()?;
            apply_func(*func, &values)
        }
    }
}

fn apply_binary(op: BinaryOp, l: ExprValue, r: ExprValue) -> Result<ExprValue, ExprError> {
    match op {
        BinaryOp::Add => match (&l, &r) {
            (ExprValue::Str(_), _) | (_, ExprValue::Str(_)) => {
                Ok(ExprValue::Str(format!("{}{}", l, r)))
            }
            _ => Ok(ExprValue::Num(l.to_number()? + r.to_number()?)),
        },
        BinaryOp::Sub => Ok(ExprValue::Num(l.to_number()? - r.to_number()?)),
        BinaryOp::Mul => Ok(ExprValue::Num(l.to_number()? * r.to_number()?)),
        BinaryOp::Div => {
            let divisor = r.to_number()?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(ExprValue::Num(l.to_number()? / divisor))
        }
        BinaryOp::Rem => {
            let divisor = r.to_number()?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(ExprValue::Num(l.to_number()? % divisor))
        }
        BinaryOp::Eq => Ok(ExprValue::Bool(loose_eq(&l, &r))),
        BinaryOp::Ne => Ok(ExprValue::Bool(!loose_eq(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l.to_number(), r.to_number()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(l.to_string().cmp(&r.to_string())),
            };
            let result = match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            };
            Ok(ExprValue::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are handled in eval_node"),
    }
}

fn loose_eq(l: &ExprValue, r: &ExprValue) -> bool {
    match (l, r) {
        (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
        _ => match (l.to_number(), r.to_number()) {
            (Ok(a), Ok(b)) => a == b,
            _ => l.to_string() == r.to_string(),
        },
    }
}

fn apply_func(func: Func, args: &[ExprValue]) -> Result<ExprValue, ExprError> {
    let first = args
        .first()
        .ok_or_else(|| ExprError::Arity(func.name().to_string()))?;
    match func {
        Func::Abs => Ok(ExprValue::Num(first.to_number()?.abs())),
        Func::Floor => Ok(ExprValue::Num(first.to_number()?.floor())),
        Func::Ceil => Ok(ExprValue::Num(first.to_number()?.ceil())),
        Func::Round => {
            let digits = match args.get(1) {
                Some(d) => d.to_number()?.clamp(0.0, 10.0) as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            Ok(ExprValue::Num((first.to_number()? * factor).round() / factor))
        }
        Func::Min | Func::Max => {
            let mut result = first.to_number()?;
            for arg in &args[1..] {
                let n = arg.to_number()?;
                result = if func == Func::Min {
                    result.min(n)
                } else {
                    result.max(n)
                };
            }
            Ok(ExprValue::Num(result))
        }
        Func::Str => Ok(ExprValue::Str(first.to_string())),
        Func::Num => Ok(ExprValue::Num(first.to_number()?)),
    }
}
