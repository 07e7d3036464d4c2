use tracing::instrument;

use crate::errors::{Result, ToolbridgeError};

/// Named functions permitted inside expressions. Anything alphabetic that is
/// not in this list fails the scan before evaluation is attempted.
const FUNCTIONS: &[&str] = &[
    "abs", "sqrt", "pow", "min", "max", "sin", "cos", "tan", "round", "floor", "ceil",
];

const ROUND_DIGITS_FACTOR: f64 = 1e12;

/// Evaluates a restricted arithmetic expression and returns a finite number.
///
/// The input is scanned character by character first: only digits, the four
/// operators, parentheses, dot, comma, whitespace and the allow-listed
/// function names survive. The filtered grammar is then parsed by a small
/// recursive-descent parser; the raw string is never handed to a
/// general-purpose interpreter.
#[instrument(skip(expression))]
pub fn evaluate(expression: &str) -> Result<f64> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(invalid("expression must not be empty"));
    }
    scan(trimmed)?;
    let tokens = tokenize(trimmed)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    parser.expect_end()?;
    if !value.is_finite() {
        return Err(invalid("expression does not evaluate to a finite number"));
    }
    Ok(round_result(value))
}

fn invalid(detail: impl Into<String>) -> ToolbridgeError {
    ToolbridgeError::InvalidExpression(detail.into())
}

fn scan(expression: &str) -> Result<()> {
    for ch in expression.chars() {
        let allowed = ch.is_ascii_digit()
            || ch.is_ascii_alphabetic()
            || ch.is_whitespace()
            || matches!(ch, '+' | '-' | '*' | '/' | '(' | ')' | '.' | ',');
        if !allowed {
            return Err(invalid(format!("character '{ch}' is not permitted")));
        }
    }
    Ok(())
}

/// Rounds to 12 decimal digits so floating-point noise does not leak into
/// results. Magnitudes too large to survive the scaling are returned as-is.
fn round_result(value: f64) -> f64 {
    if value.abs() >= 1e15 {
        return value;
    }
    (value * ROUND_DIGITS_FACTOR).round() / ROUND_DIGITS_FACTOR
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Function(&'static str),
    Plus,
    Minus,
    Star,
    Slash,
    LeftParen,
    RightParen,
    Comma,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut pos = 0;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch.is_whitespace() {
            pos += 1;
            continue;
        }
        match ch {
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '(' => tokens.push(Token::LeftParen),
            ')' => tokens.push(Token::RightParen),
            ',' => tokens.push(Token::Comma),
            _ if ch.is_ascii_digit() || ch == '.' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                let literal: String = chars[start..pos].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("malformed number '{literal}'")))?;
                tokens.push(Token::Number(number));
                continue;
            }
            _ if ch.is_ascii_alphabetic() => {
                let start = pos;
                while pos < chars.len() && chars[pos].is_ascii_alphabetic() {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                let name = FUNCTIONS
                    .iter()
                    .copied()
                    .find(|candidate| *candidate == word)
                    .ok_or_else(|| invalid(format!("unknown function '{word}'")))?;
                tokens.push(Token::Function(name));
                continue;
            }
            _ => return Err(invalid(format!("character '{ch}' is not permitted"))),
        }
        pos += 1;
    }
    if tokens.is_empty() {
        return Err(invalid("expression must not be empty"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, context: &str) -> Result<()> {
        match self.advance() {
            Some(found) if found == token => Ok(()),
            _ => Err(invalid(format!("expected {context}"))),
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(invalid("unexpected trailing input"))
        }
    }

    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.factor()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.advance();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.advance();
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::LeftParen) => {
                let value = self.expr()?;
                self.expect(Token::RightParen, "closing parenthesis")?;
                Ok(value)
            }
            Some(Token::Function(name)) => self.call(name),
            _ => Err(invalid("expected a number, function or parenthesis")),
        }
    }

    fn call(&mut self, name: &'static str) -> Result<f64> {
        self.expect(Token::LeftParen, "opening parenthesis after function name")?;
        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.advance();
            args.push(self.expr()?);
        }
        self.expect(Token::RightParen, "closing parenthesis after arguments")?;
        apply(name, &args)
    }
}

fn apply(name: &'static str, args: &[f64]) -> Result<f64> {
    let unary = |args: &[f64]| -> Result<f64> {
        match args {
            [value] => Ok(*value),
            _ => Err(invalid(format!("{name} expects exactly one argument"))),
        }
    };
    let binary = |args: &[f64]| -> Result<(f64, f64)> {
        match args {
            [left, right] => Ok((*left, *right)),
            _ => Err(invalid(format!("{name} expects exactly two arguments"))),
        }
    };
    match name {
        "abs" => Ok(unary(args)?.abs()),
        "sqrt" => Ok(unary(args)?.sqrt()),
        "sin" => Ok(unary(args)?.sin()),
        "cos" => Ok(unary(args)?.cos()),
        "tan" => Ok(unary(args)?.tan()),
        "round" => Ok(unary(args)?.round()),
        "floor" => Ok(unary(args)?.floor()),
        "ceil" => Ok(unary(args)?.ceil()),
        "pow" => {
            let (base, exponent) = binary(args)?;
            Ok(base.powf(exponent))
        }
        "min" => {
            let (left, right) = binary(args)?;
            Ok(left.min(right))
        }
        "max" => {
            let (left, right) = binary(args)?;
            Ok(left.max(right))
        }
        _ => Err(invalid(format!("unknown function '{name}'"))),
    }
}
