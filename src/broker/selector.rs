//! Message selector expressions
//!
//! A selector is a predicate over message header properties that decides
//! which messages a receiver is handed. The supported language is the
//! familiar JMS subset:
//!
//! ```text
//! CustomerIdentifier IN ('100', '200') AND SERVICE_TYPE = 'SOA'
//! NOT (RETRY_COUNT > 3) OR Supplier IS NULL
//! EVENT_CHANNEL_NAME LIKE 'soa\_%'
//! ```
//!
//! Comparisons against a missing property are unknown, and an unknown
//! result never matches.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::MessageProperties;

/// A parsed selector expression
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    In {
        property: String,
        values: Vec<Literal>,
        negated: bool,
    },
    IsNull {
        property: String,
        negated: bool,
    },
    Like {
        property: String,
        pattern: String,
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Property(String),
    Literal(Literal),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Selector {
    /// Parse a selector expression
    ///
    /// # Example
    ///
    /// ```
    /// use provbus::broker::Selector;
    /// use provbus::types::MessageProperties;
    ///
    /// let selector = Selector::parse("CustomerIdentifier IN ('100','200')").unwrap();
    /// let props = MessageProperties::new().with("CustomerIdentifier", "200");
    /// assert!(selector.matches(&props));
    /// ```
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((token, position)) = parser.tokens.get(parser.pos) {
            return Err(selector_error(*position, format!("unexpected {}", token)));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The text this selector was parsed from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a message's header properties
    pub fn matches(&self, properties: &MessageProperties) -> bool {
        eval(&self.expr, properties) == Some(true)
    }

    /// Compile to a SQL predicate over a JSONB column of string properties
    ///
    /// Property names and literal values are appended to `params` and
    /// referenced as text placeholders, numbered after any existing params.
    pub fn to_sql(&self, column: &str, params: &mut Vec<String>) -> String {
        compile(&self.expr, column, params)
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn selector_error(position: usize, message: impl Into<String>) -> Error {
    Error::Selector {
        position,
        message: message.into(),
    }
}

// Lexing

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    Op(CompareOp),
    And,
    Or,
    Not,
    In,
    Is,
    Null,
    Like,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Str(value) => write!(f, "string '{}'", value),
            Token::Num(value) => write!(f, "number {}", value),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
            Token::Op(op) => write!(f, "operator '{}'", op.symbol()),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::In => write!(f, "IN"),
            Token::Is => write!(f, "IS"),
            Token::Null => write!(f, "NULL"),
            Token::Like => write!(f, "LIKE"),
        }
    }
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, pos));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, pos));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, pos));
                i += 1;
            }
            '=' => {
                tokens.push((Token::Op(CompareOp::Eq), pos));
                i += 1;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, width) = match (c, next) {
                    ('<', Some('>')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    _ => (CompareOp::Gt, 1),
                };
                tokens.push((Token::Op(op), pos));
                i += width;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, '\'')) if matches!(chars.get(i + 1), Some((_, '\''))) => {
                            value.push('\'');
                            i += 2;
                        }
                        Some((_, '\'')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => return Err(selector_error(pos, "unterminated string literal")),
                    }
                }
                tokens.push((Token::Str(value), pos));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, n)| n.is_ascii_digit() || *n == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| selector_error(pos, format!("invalid number '{}'", text)))?;
                tokens.push((Token::Num(value), pos));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|(_, n)| n.is_alphanumeric() || *n == '_' || *n == '$' || *n == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::In,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "LIKE" => Token::Like,
                    _ => Token::Ident(word),
                };
                tokens.push((token, pos));
            }
            other => {
                return Err(selector_error(pos, format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

// Parsing

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
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

    fn expect(&mut self, expected: Token) -> Result<()> {
        let position = self.position();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(selector_error(
                position,
                format!("expected {}, found {}", expected, token),
            )),
            None => Err(selector_error(position, format!("expected {}", expected))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr> {
        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }

        let position = self.position();
        let left = self.parse_operand()?;

        match self.peek().cloned() {
            Some(Token::Op(op)) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare { left, op, right })
            }
            Some(Token::Is) => {
                self.pos += 1;
                let property = require_property(left, position)?;
                let negated = self.eat(&Token::Not);
                self.expect(Token::Null)?;
                Ok(Expr::IsNull { property, negated })
            }
            Some(Token::Not) | Some(Token::In) | Some(Token::Like) => {
                let property = require_property(left, position)?;
                let negated = self.eat(&Token::Not);
                let position = self.position();
                match self.next() {
                    Some(Token::In) => {
                        let values = self.parse_literal_list()?;
                        Ok(Expr::In {
                            property,
                            values,
                            negated,
                        })
                    }
                    Some(Token::Like) => {
                        let position = self.position();
                        match self.next() {
                            Some(Token::Str(pattern)) => Ok(Expr::Like {
                                property,
                                pattern,
                                negated,
                            }),
                            _ => Err(selector_error(position, "LIKE requires a string pattern")),
                        }
                    }
                    _ => Err(selector_error(position, "expected IN or LIKE after NOT")),
                }
            }
            Some(token) => Err(selector_error(
                self.position(),
                format!("expected comparison, found {}", token),
            )),
            None => Err(selector_error(self.position(), "expected comparison")),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let position = self.position();
        match self.next() {
            Some(Token::Ident(name)) => Ok(Operand::Property(name)),
            Some(Token::Str(value)) => Ok(Operand::Literal(Literal::Str(value))),
            Some(Token::Num(value)) => Ok(Operand::Literal(Literal::Num(value))),
            Some(token) => Err(selector_error(
                position,
                format!("expected property or literal, found {}", token),
            )),
            None => Err(selector_error(position, "unexpected end of selector")),
        }
    }

    fn parse_literal_list(&mut self) -> Result<Vec<Literal>> {
        self.expect(Token::LParen)?;
        let mut values = Vec::new();
        loop {
            let position = self.position();
            match self.next() {
                Some(Token::Str(value)) => values.push(Literal::Str(value)),
                Some(Token::Num(value)) => values.push(Literal::Num(value)),
                _ => return Err(selector_error(position, "IN list accepts only literals")),
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(values);
        }
    }
}

fn require_property(operand: Operand, position: usize) -> Result<String> {
    match operand {
        Operand::Property(name) => Ok(name),
        Operand::Literal(_) => Err(selector_error(position, "expected a property name")),
    }
}

// Evaluation

impl Literal {
    fn as_text(&self) -> String {
        match self {
            Literal::Str(value) => value.clone(),
            Literal::Num(value) => format_number(*value),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

enum Value {
    Text(String),
    Num(f64),
}

fn resolve(operand: &Operand, properties: &MessageProperties) -> Option<Value> {
    match operand {
        Operand::Property(name) => properties.get(name).map(|v| Value::Text(v.to_string())),
        Operand::Literal(Literal::Str(value)) => Some(Value::Text(value.clone())),
        Operand::Literal(Literal::Num(value)) => Some(Value::Num(*value)),
    }
}

fn compare(left: Value, op: CompareOp, right: Value) -> Option<bool> {
    let ordering = match (left, right) {
        (Value::Text(l), Value::Text(r)) => l.cmp(&r),
        (Value::Num(l), Value::Num(r)) => l.partial_cmp(&r)?,
        (Value::Text(l), Value::Num(r)) => l.trim().parse::<f64>().ok()?.partial_cmp(&r)?,
        (Value::Num(l), Value::Text(r)) => l.partial_cmp(&r.trim().parse::<f64>().ok()?)?,
    };
    Some(match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    })
}

fn eval(expr: &Expr, properties: &MessageProperties) -> Option<bool> {
    match expr {
        Expr::And(left, right) => match (eval(left, properties), eval(right, properties)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(left, right) => match (eval(left, properties), eval(right, properties)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => eval(inner, properties).map(|v| !v),
        Expr::Compare { left, op, right } => {
            compare(resolve(left, properties)?, *op, resolve(right, properties)?)
        }
        Expr::In {
            property,
            values,
            negated,
        } => {
            let value = properties.get(property)?;
            let found = values.iter().any(|literal| literal.as_text() == value);
            Some(found != *negated)
        }
        Expr::IsNull { property, negated } => Some(properties.contains(property) == *negated),
        Expr::Like {
            property,
            pattern,
            negated,
        } => {
            let value = properties.get(property)?;
            Some(like_matches(value, pattern) != *negated)
        }
    }
}

/// SQL LIKE matching: `%` is any run, `_` is one character, `\` escapes
fn like_matches(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    fn matches_from(value: &[char], pattern: &[char]) -> bool {
        match pattern.first() {
            None => value.is_empty(),
            Some('%') => (0..=value.len()).any(|skip| matches_from(&value[skip..], &pattern[1..])),
            Some('_') => !value.is_empty() && matches_from(&value[1..], &pattern[1..]),
            Some('\\') if pattern.len() > 1 => {
                value.first() == Some(&pattern[1]) && matches_from(&value[1..], &pattern[2..])
            }
            Some(c) => value.first() == Some(c) && matches_from(&value[1..], &pattern[1..]),
        }
    }

    matches_from(&value, &pattern)
}

// SQL compilation

fn push_param(params: &mut Vec<String>, value: String) -> String {
    params.push(value);
    format!("${}::text", params.len())
}

fn property_sql(column: &str, name: &str, params: &mut Vec<String>) -> String {
    let placeholder = push_param(params, name.to_string());
    format!("({} ->> {})", column, placeholder)
}

fn numeric_sql(text_sql: &str) -> String {
    format!(
        "(CASE WHEN {0} ~ '^\\s*-?[0-9]+(\\.[0-9]+)?\\s*$' THEN {0}::numeric END)",
        text_sql
    )
}

fn compile(expr: &Expr, column: &str, params: &mut Vec<String>) -> String {
    match expr {
        Expr::And(left, right) => format!(
            "({} AND {})",
            compile(left, column, params),
            compile(right, column, params)
        ),
        Expr::Or(left, right) => format!(
            "({} OR {})",
            compile(left, column, params),
            compile(right, column, params)
        ),
        Expr::Not(inner) => format!("(NOT {})", compile(inner, column, params)),
        Expr::Compare { left, op, right } => {
            let numeric = matches!(left, Operand::Literal(Literal::Num(_)))
                || matches!(right, Operand::Literal(Literal::Num(_)));
            let mut operand_sql = |operand: &Operand| {
                let text = match operand {
                    Operand::Property(name) => property_sql(column, name, params),
                    Operand::Literal(literal) => push_param(params, literal.as_text()),
                };
                if numeric {
                    numeric_sql(&text)
                } else {
                    text
                }
            };
            let left_sql = operand_sql(left);
            let right_sql = operand_sql(right);
            format!("({} {} {})", left_sql, op.symbol(), right_sql)
        }
        Expr::In {
            property,
            values,
            negated,
        } => {
            let property = property_sql(column, property, params);
            let list: Vec<String> = values
                .iter()
                .map(|literal| push_param(params, literal.as_text()))
                .collect();
            format!(
                "({} {}IN ({}))",
                property,
                if *negated { "NOT " } else { "" },
                list.join(", ")
            )
        }
        Expr::IsNull { property, negated } => format!(
            "({} IS {}NULL)",
            property_sql(column, property, params),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Like {
            property,
            pattern,
            negated,
        } => {
            let property = property_sql(column, property, params);
            let pattern = push_param(params, pattern.clone());
            format!(
                "({} {}LIKE {})",
                property,
                if *negated { "NOT " } else { "" },
                pattern
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn props(pairs: &[(&str, &str)]) -> MessageProperties {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_in_list() {
        let selector = Selector::parse("CustomerIdentifier IN ('100','200')").unwrap();
        assert!(selector.matches(&props(&[("CustomerIdentifier", "100")])));
        assert!(selector.matches(&props(&[("CustomerIdentifier", "200")])));
        assert!(!selector.matches(&props(&[("CustomerIdentifier", "300")])));
        assert!(!selector.matches(&props(&[])));
    }

    #[test]
    fn test_not_in_with_missing_property_is_unknown() {
        let selector = Selector::parse("CustomerIdentifier NOT IN ('100')").unwrap();
        assert!(selector.matches(&props(&[("CustomerIdentifier", "200")])));
        assert!(!selector.matches(&props(&[("CustomerIdentifier", "100")])));
        assert!(!selector.matches(&props(&[])));
    }

    #[test]
    fn test_equality_and_boolean_logic() {
        let selector =
            Selector::parse("SERVICE_TYPE = 'SOA' and (Supplier <> 'X' or Supplier is null)")
                .unwrap();
        assert!(selector.matches(&props(&[("SERVICE_TYPE", "SOA")])));
        assert!(selector.matches(&props(&[("SERVICE_TYPE", "SOA"), ("Supplier", "Y")])));
        assert!(!selector.matches(&props(&[("SERVICE_TYPE", "SOA"), ("Supplier", "X")])));
        assert!(!selector.matches(&props(&[("SERVICE_TYPE", "LSR")])));
    }

    #[test]
    fn test_not_and_numeric_comparison() {
        let selector = Selector::parse("NOT (RETRY_COUNT > 3)").unwrap();
        assert!(selector.matches(&props(&[("RETRY_COUNT", "2")])));
        assert!(!selector.matches(&props(&[("RETRY_COUNT", "10")])));
        assert!(!selector.matches(&props(&[("RETRY_COUNT", "abc")])));
        assert!(!selector.matches(&props(&[])));
    }

    #[test]
    fn test_like() {
        let selector = Selector::parse("EVENT_CHANNEL_NAME LIKE 'soa\\_%'").unwrap();
        assert!(selector.matches(&props(&[("EVENT_CHANNEL_NAME", "soa_events_100")])));
        assert!(!selector.matches(&props(&[("EVENT_CHANNEL_NAME", "soaXevents")])));

        let negated = Selector::parse("name NOT LIKE 'a_c'").unwrap();
        assert!(negated.matches(&props(&[("name", "abd")])));
        assert!(!negated.matches(&props(&[("name", "abc")])));
    }

    #[test]
    fn test_quoted_literal_escape() {
        let selector = Selector::parse("owner = 'O''Brien'").unwrap();
        assert!(selector.matches(&props(&[("owner", "O'Brien")])));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        match Selector::parse("a IN ('1'") {
            Err(Error::Selector { position, .. }) => assert_eq!(position, 9),
            other => panic!("expected selector error, got {:?}", other),
        }
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("a = ").is_err());
        assert!(Selector::parse("a = 'x' b").is_err());
        assert!(Selector::parse("'x' IS NULL").is_err());
        assert!(Selector::parse("a = 'unterminated").is_err());
        assert!(Selector::parse("a # b").is_err());
    }

    #[test]
    fn test_to_sql_in_list() {
        let selector = Selector::parse("CustomerIdentifier IN ('100','200')").unwrap();
        let mut params = Vec::new();
        let sql = selector.to_sql("properties", &mut params);

        assert_eq!(sql, "((properties ->> $1::text) IN ($2::text, $3::text))");
        assert_eq!(params, vec!["CustomerIdentifier", "100", "200"]);
    }

    #[test]
    fn test_to_sql_numbers_placeholders_after_existing_params() {
        let selector = Selector::parse("RETRY_COUNT >= 2 AND a IS NOT NULL").unwrap();
        let mut params = vec!["Q1".to_string()];
        let sql = selector.to_sql("m.properties", &mut params);

        assert!(sql.contains("$2::text"));
        assert!(sql.contains("::numeric"));
        assert!(sql.contains("IS NOT NULL"));
        assert_eq!(params, vec!["Q1", "RETRY_COUNT", "2", "a"]);
    }

    proptest! {
        #[test]
        fn prop_quoted_values_round_trip(value in "[ -~]{0,16}") {
            let source = format!("p = '{}'", value.replace('\'', "''"));
            let selector = Selector::parse(&source).unwrap();
            let matching = MessageProperties::new().with("p", value.clone());
            prop_assert!(selector.matches(&matching));
        }

        #[test]
        fn prop_in_list_matches_exactly_its_members(
            members in proptest::collection::btree_set("[a-z0-9]{1,6}", 1..6),
            candidate in "[a-z0-9]{1,6}",
        ) {
            let list: Vec<String> = members.iter().map(|m| format!("'{}'", m)).collect();
            let selector = Selector::parse(&format!("t IN ({})", list.join(","))).unwrap();
            let props = MessageProperties::new().with("t", candidate.clone());
            prop_assert_eq!(selector.matches(&props), members.contains(&candidate));
        }
    }
}
