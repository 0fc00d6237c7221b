//! Browser user-agent generators.
//!
//! Every generator takes the caller's random source so sessions stay
//! independent and seeded sessions stay reproducible.

use rand::Rng;
use rand::seq::SliceRandom;

/// Browser families a user agent can imitate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    InternetExplorer,
    Opera,
    OperaMini,
}

impl BrowserFamily {
    /// Popularity weights used by [`random_user_agent`], in percent.
    pub const WEIGHTS: [(BrowserFamily, u32); 5] = [
        (BrowserFamily::Chrome, 60),
        (BrowserFamily::Firefox, 20),
        (BrowserFamily::InternetExplorer, 10),
        (BrowserFamily::Opera, 6),
        (BrowserFamily::OperaMini, 4),
    ];

    pub fn user_agent<R: Rng + ?Sized>(self, rng: &mut R) -> String {
        match self {
            BrowserFamily::Chrome => chrome_user_agent(rng),
            BrowserFamily::Firefox => firefox_user_agent(rng),
            BrowserFamily::InternetExplorer => ie_user_agent(rng),
            BrowserFamily::Opera => opera_user_agent(rng),
            BrowserFamily::OperaMini => opera_mini_user_agent(rng),
        }
    }
}

const FIREFOX_VERSIONS: [u8; 6] = [58, 56, 52, 50, 47, 39];

// (version, presto)
const OPERA_BUILDS: [(&str, &str); 4] = [
    ("12.16", "2.12.388"),
    ("12.14", "2.12.388"),
    ("12.02", "2.10.289"),
    ("12.00", "2.10.181"),
];

// (os, mini version, version, presto)
const OPERA_MINI_BUILDS: [(&str, &str, &str, &str); 3] = [
    ("iOS", "7.0.73345", "11.62", "2.10.229"),
    ("J2ME/MIDP", "7.1.23511", "12.00", "2.10.181"),
    ("Android", "7.5.54678", "12.02", "2.10.289"),
];

const XP_64: &str = "5.2";

/// Weighted pick over [`BrowserFamily::WEIGHTS`].
pub fn random_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let family = pick_family(rng.gen_range(1..=100));
    family.user_agent(rng)
}

fn pick_family(roll: u32) -> BrowserFamily {
    let mut threshold = 0;
    for (family, weight) in BrowserFamily::WEIGHTS {
        threshold += weight;
        if roll <= threshold {
            return family;
        }
    }
    BrowserFamily::OperaMini
}

pub fn chrome_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let major = rng.gen_range(41..64);
    let build = rng.gen_range(2100..3200);
    let branch = rng.gen_range(0..170);
    format!(
        "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build}.{branch} Safari/537.36",
        random_windows_version(rng)
    )
}

pub fn firefox_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let version = FIREFOX_VERSIONS.choose(rng).copied().unwrap_or(FIREFOX_VERSIONS[0]);
    format!(
        "Mozilla/5.0 ({}; rv:{version}.0) Gecko/20100101 Firefox/{version}.0",
        random_windows_version(rng)
    )
}

pub fn ie_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let windows = random_windows_version(rng);
    let (version, trident, extras) = if windows.contains("NT 5.1") {
        ("9.0", "5.0", ".NET CLR 2.0.50727; .NET CLR 3.5.30729")
    } else if windows.contains("NT 6.0") {
        ("9.0", "5.0", ".NET CLR 2.0.50727; Media Center PC 5.0; .NET CLR 3.5.30729")
    } else {
        let (version, trident) = match rng.gen_range(0..3) {
            0 => ("10.0", "6.0"),
            1 => ("10.6", "6.0"),
            _ => ("11.0", "7.0"),
        };
        (
            version,
            trident,
            ".NET CLR 2.0.50727; .NET CLR 3.5.30729; .NET CLR 3.0.30729; Media Center PC 6.0; .NET4.0C; .NET4.0E",
        )
    };
    format!("Mozilla/5.0 (compatible; MSIE {version}; {windows}; Trident/{trident}; {extras})")
}

pub fn opera_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let (version, presto) = OPERA_BUILDS.choose(rng).copied().unwrap_or(OPERA_BUILDS[0]);
    format!(
        "Opera/9.80 ({}); U) Presto/{presto} Version/{version}",
        random_windows_version(rng)
    )
}

pub fn opera_mini_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    let (os, mini, version, presto) = OPERA_MINI_BUILDS.choose(rng).copied().unwrap_or(OPERA_MINI_BUILDS[0]);
    format!("Opera/9.80 ({os}; Opera Mini/{mini}/28.2555; U; ru) Presto/{presto} Version/{version}")
}

/// `Windows NT x.y` weighted by desktop share, optionally tagged 64-bit.
pub fn random_windows_version<R: Rng + ?Sized>(rng: &mut R) -> String {
    let nt = match rng.gen_range(1..=100) {
        1..=40 => "10.0",
        41..=80 => "6.1",
        81..=90 => "6.3",
        91..=94 => "5.1",
        95..=97 => "6.2",
        _ => XP_64,
    };

    let mut windows = format!("Windows NT {nt}");
    // XP x64 only ever shipped as 64-bit.
    if nt == XP_64 || rng.gen_bool(0.5) {
        windows.push_str(if rng.gen_bool(0.5) { "; WOW64" } else { "; Win64; x64" });
    }
    windows
}
