//! Data shared between challenge analysis and the bypass loops.

use std::fmt;
use std::hash::{Hash, Hasher};

use url::Url;

use crate::error::ProtocolError;

/// Everything needed to submit a solved JS challenge.
#[derive(Debug, Clone)]
pub struct ChallengeSolution {
    /// Path of the clearance endpoint, taken from the challenge form action.
    pub clearance_page: String,
    pub verification_code: String,
    pub pass: String,
    pub answer: f64,
    /// The page asked for an integer answer.
    pub integer_tag: bool,
}

impl ChallengeSolution {
    pub fn new(
        clearance_page: impl Into<String>,
        verification_code: impl Into<String>,
        pass: impl Into<String>,
        answer: f64,
    ) -> Self {
        Self {
            clearance_page: clearance_page.into(),
            verification_code: verification_code.into(),
            pass: pass.into(),
            answer,
            integer_tag: false,
        }
    }

    pub fn with_integer_tag(mut self, integer_tag: bool) -> Self {
        self.integer_tag = integer_tag;
        self
    }

    /// `{page}?jschl_vc={vc}&pass={pass}&jschl_answer={answer}`.
    ///
    /// The answer uses the shortest decimal that round-trips, never an
    /// exponent for ordinary magnitudes.
    pub fn clearance_query(&self) -> String {
        format!(
            "{}?jschl_vc={}&pass={}&jschl_answer={}",
            self.clearance_page, self.verification_code, self.pass, self.answer
        )
    }

    /// Clearance query made absolute against the challenged address, with an
    /// explicit port.
    pub fn clearance_url(&self, challenged: &Url) -> Result<Url, ProtocolError> {
        let host = challenged
            .host_str()
            .ok_or_else(|| ProtocolError::InvalidAddress(format!("{challenged} has no host")))?;
        let port = challenged.port_or_known_default().unwrap_or(80);
        let address = format!(
            "{}://{}:{}{}",
            challenged.scheme(),
            host,
            port,
            self.clearance_query()
        );
        Url::parse(&address).map_err(|err| ProtocolError::InvalidAddress(format!("{address}: {err}")))
    }
}

impl PartialEq for ChallengeSolution {
    fn eq(&self, other: &Self) -> bool {
        self.clearance_query() == other.clearance_query()
    }
}

impl Eq for ChallengeSolution {}

impl Hash for ChallengeSolution {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.clearance_query().hash(state);
    }
}

impl fmt::Display for ChallengeSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clearance_query())
    }
}
