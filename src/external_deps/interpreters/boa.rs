use boa_engine::{Context, Source};

use super::{ArithmeticChallenge, ArithmeticEvaluator, InterpreterError, InterpreterResult};

/// Evaluator backed by the Boa JavaScript engine.
///
/// Runs the extracted seed and steps as a standalone program, so page
/// globals such as `document` or `setTimeout` are never needed.
#[derive(Debug, Default)]
pub struct BoaArithmeticEvaluator;

impl BoaArithmeticEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Run an arbitrary script and return its completion value as a string.
    pub fn execute(&self, script: &str) -> InterpreterResult<String> {
        let mut context = Context::default();
        let result = context
            .eval(Source::from_bytes(script))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;

        result
            .to_string(&mut context)
            .map_err(|err| InterpreterError::Execution(err.to_string()))?
            .to_std_string()
            .map_err(|_| InterpreterError::Other("unable to convert interpreter output".into()))
    }
}

impl ArithmeticEvaluator for BoaArithmeticEvaluator {
    fn name(&self) -> &'static str {
        "boa"
    }

    fn evaluate(&self, challenge: &ArithmeticChallenge) -> InterpreterResult<f64> {
        let program = challenge.to_javascript();
        let mut context = Context::default();

        let value = context
            .eval(Source::from_bytes(&program))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;

        if value.is_null() || value.is_undefined() {
            return Err(InterpreterError::Execution(
                "challenge program produced no value".into(),
            ));
        }

        value
            .to_number(&mut context)
            .map_err(|err| InterpreterError::Execution(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::interpreters::NativeArithmeticEvaluator;

    #[test]
    fn agrees_with_native_evaluator() {
        let challenge = ArithmeticChallenge::extract(super::super::tests::SCRIPT, "example.com").unwrap();
        let boa = BoaArithmeticEvaluator::new().evaluate(&challenge).unwrap();
        let native = NativeArithmeticEvaluator::new().evaluate(&challenge).unwrap();
        assert_eq!(boa, native);
    }

    #[test]
    fn executes_plain_scripts() {
        let interpreter = BoaArithmeticEvaluator::new();
        assert_eq!(interpreter.execute("var a = 10; var b = 5; a + b").unwrap(), "15");
    }

    #[test]
    fn surfaces_syntax_errors() {
        let err = BoaArithmeticEvaluator::new().execute("var = ;").unwrap_err();
        assert!(matches!(err, InterpreterError::Execution(_)));
    }
}
