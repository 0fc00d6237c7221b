//! Utilities shared by the challenge bypasses.

pub mod analysis;
pub mod timing;
pub mod types;

pub use analysis::{
    CLEARANCE_COOKIE, CaptchaPage, ChallengeParseError, JsChallengePage, anti_bot_headers, classify,
    is_protected, is_protected_response,
};
pub use timing::{Cancelled, interruptible_delay};
pub use types::ChallengeSolution;
