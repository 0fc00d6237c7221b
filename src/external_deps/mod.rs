//! Collaborators that live outside the request engine.
//!
//! Captcha solving is delegated to caller-supplied providers; arithmetic
//! challenges are evaluated by pluggable runtimes.

pub mod captcha;
pub mod interpreters;

pub use captcha::{CaptchaError, CaptchaProvider, CaptchaSolution, CaptchaTask};
pub use interpreters::{
    ArithmeticChallenge, ArithmeticEvaluator, BoaArithmeticEvaluator, InterpreterError,
    NativeArithmeticEvaluator,
};
