//! Arithmetic challenge evaluation.
//!
//! A JS challenge page hides its answer behind a seed object and a series of
//! compound assignments written in coerced JavaScript (`!+[]`, `!![]`, ...).
//! [`ArithmeticChallenge`] extracts that program from the page script and an
//! [`ArithmeticEvaluator`] runs it. Two runtimes are provided: a small native
//! evaluator for the coercion subset and the Boa engine.

mod boa;
mod native;

pub use boa::BoaArithmeticEvaluator;
pub use native::NativeArithmeticEvaluator;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Compound assignment operator of one challenge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "+" => Some(AssignOp::Add),
            "-" => Some(AssignOp::Sub),
            "*" => Some(AssignOp::Mul),
            "/" => Some(AssignOp::Div),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            AssignOp::Add => '+',
            AssignOp::Sub => '-',
            AssignOp::Mul => '*',
            AssignOp::Div => '/',
        }
    }
}

/// `object.property <op>= expression;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArithmeticStep {
    pub op: AssignOp,
    pub expression: String,
}

/// Program extracted from a challenge script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArithmeticChallenge {
    pub object: String,
    pub property: String,
    /// Initial value expression of `object.property`.
    pub seed: String,
    pub steps: Vec<ArithmeticStep>,
    /// Host whose length is added to the result.
    pub host: String,
    /// The page truncates with `parseInt` instead of `toFixed(10)`.
    pub integer_answer: bool,
}

static SEED_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?P<object>[A-Za-z_$][\w$]*)\s*=\s*\{\s*"(?P<property>[\w$]+)"\s*:\s*(?P<seed>[^}]+)\}"#)
        .build()
        .unwrap()
});

impl ArithmeticChallenge {
    /// Extract the seed and assignment steps from challenge JavaScript.
    pub fn extract(script: &str, host: &str) -> InterpreterResult<Self> {
        let seed = SEED_RE
            .captures(script)
            .ok_or(InterpreterError::MissingMarker("seed object"))?;
        let object = seed["object"].to_string();
        let property = seed["property"].to_string();
        let rest = &script[seed.get(0).map_or(0, |m| m.end())..];

        let step_re = Regex::new(&format!(
            r"{}\.{}\s*(?P<op>[+\-*/])=\s*(?P<expr>[^;]+);",
            regex::escape(&object),
            regex::escape(&property)
        ))
        .map_err(|err| InterpreterError::Other(err.to_string()))?;

        let steps = step_re
            .captures_iter(rest)
            .filter_map(|caps| {
                Some(ArithmeticStep {
                    op: AssignOp::from_symbol(&caps["op"])?,
                    expression: caps["expr"].trim().to_string(),
                })
            })
            .collect();

        Ok(Self {
            seed: seed["seed"].trim().to_string(),
            object,
            property,
            steps,
            host: host.to_string(),
            integer_answer: script.contains("parseInt("),
        })
    }

    /// Final answer: evaluated value adjusted by the host length, truncated
    /// or rounded to 10 decimals the way the page would.
    pub fn answer(&self, evaluator: &dyn ArithmeticEvaluator) -> InterpreterResult<f64> {
        let value = evaluator.evaluate(self)?;
        if !value.is_finite() {
            return Err(InterpreterError::Execution(format!(
                "{} produced a non-finite value",
                evaluator.name()
            )));
        }
        let host_length = self.host.len() as f64;
        if self.integer_answer {
            Ok(value.trunc() + host_length)
        } else {
            Ok(round_to_10(value + host_length))
        }
    }

    /// Equivalent standalone JavaScript whose completion value is the result.
    pub fn to_javascript(&self) -> String {
        let mut program = format!(
            "var {object} = {{\"{property}\": {seed}}};\n",
            object = self.object,
            property = self.property,
            seed = self.seed
        );
        for step in &self.steps {
            program.push_str(&format!(
                "{}.{} {}= {};\n",
                self.object,
                self.property,
                step.op.symbol(),
                step.expression
            ));
        }
        program.push_str(&format!("+{}.{};", self.object, self.property));
        program
    }
}

fn round_to_10(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

/// Runtime able to evaluate an [`ArithmeticChallenge`].
pub trait ArithmeticEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Value of `object.property` after every step, before the host adjustment.
    fn evaluate(&self, challenge: &ArithmeticChallenge) -> InterpreterResult<f64>;
}

/// Failures produced by evaluators.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("javascript execution failed: {0}")]
    Execution(String),
    #[error("challenge script is missing the {0}")]
    MissingMarker(&'static str),
    #[error("javascript engine error: {0}")]
    Other(String),
}

/// Convenience alias for runtime results.
pub type InterpreterResult<T> = Result<T, InterpreterError>;

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) const SCRIPT: &str = r#"
        setTimeout(function(){
          var s,t,o,p,b,r,e,a,k,i,n,g,f, KEkyTZt={"gYtTMXD":+((!+[]+!![]+!![]+[])+(!+[]+!![]+!![]+!![]+!![]+!![]))};
          t = document.createElement('div');
          a = document.getElementById('jschl-answer');
          ;KEkyTZt.gYtTMXD+=+((!+[]+!![]+[])+(!+[]+!![]+!![]));KEkyTZt.gYtTMXD*=+((!+[]+!![]+!![]+[])+(+!![]));KEkyTZt.gYtTMXD-=!+[]+!![];a.value = parseInt(KEkyTZt.gYtTMXD, 10) + t.length;
        }, 4000);
    "#;

    #[test]
    fn extracts_seed_and_steps() {
        let challenge = ArithmeticChallenge::extract(SCRIPT, "example.com").unwrap();
        assert_eq!(challenge.object, "KEkyTZt");
        assert_eq!(challenge.property, "gYtTMXD");
        assert_eq!(challenge.steps.len(), 3);
        assert_eq!(challenge.steps[1].op, AssignOp::Mul);
        assert_eq!(challenge.steps[2].expression, "!+[]+!![]");
        assert!(challenge.integer_answer);
    }

    #[test]
    fn missing_seed_is_reported() {
        let err = ArithmeticChallenge::extract("var a = 1;", "h").unwrap_err();
        assert!(matches!(err, InterpreterError::MissingMarker("seed object")));
    }

    #[test]
    fn program_mirrors_steps() {
        let challenge = ArithmeticChallenge::extract(SCRIPT, "example.com").unwrap();
        let program = challenge.to_javascript();
        assert!(program.starts_with("var KEkyTZt = {\"gYtTMXD\": +((!+[]"));
        assert!(program.contains("KEkyTZt.gYtTMXD *= "));
        assert!(program.ends_with("+KEkyTZt.gYtTMXD;"));
    }

    #[test]
    fn rounds_non_integer_answers() {
        assert_eq!(round_to_10(1.000_000_000_04), 1.0);
        assert_eq!(round_to_10(2.5), 2.5);
    }
}
