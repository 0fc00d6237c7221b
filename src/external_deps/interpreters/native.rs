use super::{ArithmeticChallenge, ArithmeticEvaluator, AssignOp, InterpreterError, InterpreterResult};

/// Nesting limit for parenthesised and unary expressions.
const MAX_DEPTH: usize = 256;

/// Evaluator for the coercion subset used by arithmetic challenges:
/// `+ - * / !`, parentheses, `[]`, number and string literals, with
/// JavaScript's string/number/boolean conversion rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeArithmeticEvaluator;

impl NativeArithmeticEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a single expression to a number.
    pub fn evaluate_expression(&self, source: &str) -> InterpreterResult<f64> {
        Parser::parse(source).map(|value| value.to_number())
    }
}

impl ArithmeticEvaluator for NativeArithmeticEvaluator {
    fn name(&self) -> &'static str {
        "native"
    }

    fn evaluate(&self, challenge: &ArithmeticChallenge) -> InterpreterResult<f64> {
        let mut value = self.evaluate_expression(&challenge.seed)?;
        for step in &challenge.steps {
            let operand = self.evaluate_expression(&step.expression)?;
            value = match step.op {
                AssignOp::Add => value + operand,
                AssignOp::Sub => value - operand,
                AssignOp::Mul => value * operand,
                AssignOp::Div => value / operand,
            };
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum JsValue {
    Number(f64),
    Bool(bool),
    Str(String),
    /// `[]`, whose primitive form is the empty string.
    EmptyArray,
}

impl JsValue {
    fn to_number(&self) -> f64 {
        match self {
            JsValue::Number(n) => *n,
            JsValue::Bool(b) => f64::from(u8::from(*b)),
            JsValue::Str(s) => string_to_number(s),
            JsValue::EmptyArray => 0.0,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::Bool(b) => *b,
            JsValue::Str(s) => !s.is_empty(),
            JsValue::EmptyArray => true,
        }
    }

    fn to_js_string(&self) -> String {
        match self {
            JsValue::Number(n) => number_to_string(*n),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Str(s) => s.clone(),
            JsValue::EmptyArray => String::new(),
        }
    }

    fn concatenates(&self) -> bool {
        matches!(self, JsValue::Str(_) | JsValue::EmptyArray)
    }
}

fn add(lhs: JsValue, rhs: JsValue) -> JsValue {
    if lhs.concatenates() || rhs.concatenates() {
        JsValue::Str(lhs.to_js_string() + &rhs.to_js_string())
    } else {
        JsValue::Number(lhs.to_number() + rhs.to_number())
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    match trimmed {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')) => {
            trimmed.parse().unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        n.to_string()
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn parse(source: &'a str) -> InterpreterResult<JsValue> {
        let mut parser = Parser {
            src: source.as_bytes(),
            pos: 0,
            depth: 0,
        };
        let value = parser.additive()?;
        parser.skip_whitespace();
        if parser.pos != parser.src.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(value)
    }

    fn additive(&mut self) -> InterpreterResult<JsValue> {
        let mut lhs = self.multiplicative()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    let rhs = self.multiplicative()?;
                    lhs = add(lhs, rhs);
                }
                Some(b'-') => {
                    self.pos += 1;
                    let rhs = self.multiplicative()?;
                    lhs = JsValue::Number(lhs.to_number() - rhs.to_number());
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn multiplicative(&mut self) -> InterpreterResult<JsValue> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    lhs = JsValue::Number(lhs.to_number() * rhs.to_number());
                }
                Some(b'/') => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    lhs = JsValue::Number(lhs.to_number() / rhs.to_number());
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> InterpreterResult<JsValue> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        let value = match self.peek() {
            Some(b'+') => {
                self.pos += 1;
                JsValue::Number(self.unary()?.to_number())
            }
            Some(b'-') => {
                self.pos += 1;
                JsValue::Number(-self.unary()?.to_number())
            }
            Some(b'!') => {
                self.pos += 1;
                JsValue::Bool(!self.unary()?.truthy())
            }
            _ => self.primary()?,
        };
        self.depth -= 1;
        Ok(value)
    }

    fn primary(&mut self) -> InterpreterResult<JsValue> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.additive()?;
                self.expect(b')')?;
                Ok(value)
            }
            Some(b'[') => {
                self.pos += 1;
                self.expect(b']')?;
                Ok(JsValue::EmptyArray)
            }
            Some(quote @ (b'"' | b'\'')) => self.string(quote),
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn number(&mut self) -> InterpreterResult<JsValue> {
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'.')
        {
            self.pos += 1;
        }
        let literal = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        literal
            .parse()
            .map(JsValue::Number)
            .map_err(|_| self.error("invalid number literal"))
    }

    fn string(&mut self, quote: u8) -> InterpreterResult<JsValue> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.src.get(self.pos) {
            if *c == quote {
                let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(JsValue::Str(text));
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string literal"))
    }

    fn expect(&mut self, byte: u8) -> InterpreterResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    /// Next non-whitespace byte, without consuming it.
    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.src.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.src.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> InterpreterError {
        InterpreterError::Execution(format!("{message} at offset {}", self.pos))
    }
}
