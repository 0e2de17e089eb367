//! Four-axis quality rubric for generated HTML.
//!
//! Scores a document on Conatus (agency), Ratio (structure), Laetitia
//! (beauty) and Natura (naturalness). Each axis sums weighted indicator
//! checks and clamps to 1. The indicator set is replaceable; axis names,
//! grade boundaries and the `[0,1]` range are fixed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One rubric axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Agency and effect: inputs, handlers, persistence, visualization
    Conatus,
    /// Structural adequacy: doctype, closing tags, scripts, error handling
    Ratio,
    /// Beauty: styles, transitions, gradients, responsiveness
    Laetitia,
    /// Naturalness and accessibility: semantics, ARIA, placeholders
    Natura,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conatus => write!(f, "conatus"),
            Self::Ratio => write!(f, "ratio"),
            Self::Laetitia => write!(f, "laetitia"),
            Self::Natura => write!(f, "natura"),
        }
    }
}

/// Letter grade derived from the mean of the four axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    B,
    C,
    D,
}

impl Grade {
    /// The unique grade for a total score.
    pub fn from_total(total: f64) -> Self {
        if total >= 0.85 {
            Self::S
        } else if total >= 0.70 {
            Self::A
        } else if total >= 0.55 {
            Self::B
        } else if total >= 0.40 {
            Self::C
        } else {
            Self::D
        }
    }

    /// Parse a grade letter, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" => Some(Self::S),
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            _ => None,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S => write!(f, "S"),
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
        }
    }
}

/// The rubric's verdict for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub conatus: f64,
    pub ratio: f64,
    pub laetitia: f64,
    pub natura: f64,
    /// Mean of the four axes.
    pub total: f64,
    pub grade: Grade,
    /// Missed indicators, in declaration order.
    pub issues: Vec<String>,
}

impl Score {
    /// Assemble a score from raw axis values, deriving total and grade.
    pub fn from_axes(conatus: f64, ratio: f64, laetitia: f64, natura: f64, issues: Vec<String>) -> Self {
        let conatus = conatus.clamp(0.0, 1.0);
        let ratio = ratio.clamp(0.0, 1.0);
        let laetitia = laetitia.clamp(0.0, 1.0);
        let natura = natura.clamp(0.0, 1.0);
        let total = (conatus + ratio + laetitia + natura) / 4.0;
        Self {
            conatus,
            ratio,
            laetitia,
            natura,
            total,
            grade: Grade::from_total(total),
            issues,
        }
    }

    /// A zero score; used when a generation candidate failed outright.
    pub fn zero() -> Self {
        Self::from_axes(0.0, 0.0, 0.0, 0.0, vec!["generation failed".to_string()])
    }

    /// Axis value by name.
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Conatus => self.conatus,
            Axis::Ratio => self.ratio,
            Axis::Laetitia => self.laetitia,
            Axis::Natura => self.natura,
        }
    }

    /// Axes ordered weakest-first; ties keep declaration order.
    pub fn weakest_axes(&self) -> Vec<Axis> {
        let mut axes = vec![Axis::Conatus, Axis::Ratio, Axis::Laetitia, Axis::Natura];
        axes.sort_by(|a, b| {
            self.axis(*a)
                .partial_cmp(&self.axis(*b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        axes
    }
}

/// A replaceable indicator check over raw HTML.
pub trait IndicatorTest: Send + Sync {
    fn matches(&self, html: &str) -> bool;
}

/// Regex-backed indicator test.
pub struct RegexTest(Regex);

impl RegexTest {
    pub fn new(pattern: &str) -> Self {
        Self(Regex::new(pattern).expect("invalid indicator pattern"))
    }
}

impl IndicatorTest for RegexTest {
    fn matches(&self, html: &str) -> bool {
        self.0.is_match(html)
    }
}

/// Minimum-length indicator test.
pub struct MinLengthTest(pub usize);

impl IndicatorTest for MinLengthTest {
    fn matches(&self, html: &str) -> bool {
        html.len() > self.0
    }
}

/// Non-ASCII glyph indicator (icons, emoji, typographic detail).
pub struct GlyphTest;

impl IndicatorTest for GlyphTest {
    fn matches(&self, html: &str) -> bool {
        html.chars().any(|c| !c.is_ascii())
    }
}

/// One weighted indicator contributing to an axis.
pub struct Indicator {
    pub axis: Axis,
    pub weight: f64,
    pub name: &'static str,
    pub test: Box<dyn IndicatorTest>,
}

impl Indicator {
    pub fn new(
        axis: Axis,
        weight: f64,
        name: &'static str,
        test: impl IndicatorTest + 'static,
    ) -> Self {
        Self {
            axis,
            weight,
            name,
            test: Box::new(test),
        }
    }
}

fn default_indicators() -> Vec<Indicator> {
    vec![
        // Conatus: can the user act, and does it stick?
        Indicator::new(
            Axis::Conatus,
            0.30,
            "no interactive input elements",
            RegexTest::new(r"(?i)<(input|textarea|select|button)\b"),
        ),
        Indicator::new(
            Axis::Conatus,
            0.30,
            "no event handlers",
            RegexTest::new(r#"(?i)\bon(click|input|change|submit|keydown|keyup)\s*=|addEventListener"#),
        ),
        Indicator::new(
            Axis::Conatus,
            0.25,
            "no persistent storage",
            RegexTest::new(r"localStorage|sessionStorage|indexedDB"),
        ),
        Indicator::new(
            Axis::Conatus,
            0.15,
            "no canvas or visualization",
            RegexTest::new(r"(?i)<canvas\b|<svg\b|\bchart\b"),
        ),
        // Ratio: is the document structurally adequate?
        Indicator::new(
            Axis::Ratio,
            0.25,
            "missing doctype",
            RegexTest::new(r"(?i)<!doctype"),
        ),
        Indicator::new(
            Axis::Ratio,
            0.20,
            "unclosed document",
            RegexTest::new(r"(?i)</html>"),
        ),
        Indicator::new(
            Axis::Ratio,
            0.25,
            "no script logic",
            RegexTest::new(r"(?i)<script\b"),
        ),
        Indicator::new(
            Axis::Ratio,
            0.10,
            "no error handling",
            RegexTest::new(r"try\s*\{|catch\s*\(|\.catch\("),
        ),
        Indicator::new(Axis::Ratio, 0.20, "trivially short document", MinLengthTest(2_000)),
        // Laetitia: is it pleasant to look at?
        Indicator::new(
            Axis::Laetitia,
            0.30,
            "no embedded styles",
            RegexTest::new(r"(?i)<style\b"),
        ),
        Indicator::new(
            Axis::Laetitia,
            0.15,
            "no CSS custom properties",
            RegexTest::new(r"--[a-zA-Z][\w-]*\s*:"),
        ),
        Indicator::new(
            Axis::Laetitia,
            0.25,
            "no transitions or animations",
            RegexTest::new(r"(?i)transition\s*:|animation\s*:|@keyframes"),
        ),
        Indicator::new(
            Axis::Laetitia,
            0.15,
            "no gradients",
            RegexTest::new(r"(?i)(linear|radial|conic)-gradient\("),
        ),
        Indicator::new(
            Axis::Laetitia,
            0.15,
            "no responsive media queries",
            RegexTest::new(r"@media\b"),
        ),
        // Natura: does it read naturally to people and assistive tech?
        Indicator::new(
            Axis::Natura,
            0.30,
            "no semantic elements",
            RegexTest::new(r"(?i)<(main|header|footer|nav|section|article|aside)\b"),
        ),
        Indicator::new(
            Axis::Natura,
            0.25,
            "no ARIA or role attributes",
            RegexTest::new(r#"(?i)\baria-[a-z]+\s*=|\brole\s*="#),
        ),
        Indicator::new(
            Axis::Natura,
            0.15,
            "no input placeholders",
            RegexTest::new(r"(?i)\bplaceholder\s*="),
        ),
        Indicator::new(
            Axis::Natura,
            0.15,
            "missing title",
            RegexTest::new(r"(?i)<title\b"),
        ),
        Indicator::new(Axis::Natura, 0.15, "no glyphs beyond ASCII", GlyphTest),
    ]
}

/// Deterministic four-axis validator.
///
/// `validate` is a pure function of the HTML: no I/O, no clock, no state.
pub struct Validator {
    indicators: Vec<Indicator>,
}

impl Validator {
    /// Validator with the default indicator set.
    pub fn new() -> Self {
        Self {
            indicators: default_indicators(),
        }
    }

    /// Validator with a custom indicator set.
    pub fn with_indicators(indicators: Vec<Indicator>) -> Self {
        Self { indicators }
    }

    /// Score a document.
    pub fn validate(&self, html: &str) -> Score {
        let mut sums = [0.0f64; 4];
        let mut issues = Vec::new();

        for indicator in &self.indicators {
            if indicator.test.matches(html) {
                let slot = match indicator.axis {
                    Axis::Conatus => 0,
                    Axis::Ratio => 1,
                    Axis::Laetitia => 2,
                    Axis::Natura => 3,
                };
                sums[slot] += indicator.weight;
            } else {
                issues.push(indicator.name.to_string());
            }
        }

        Score::from_axes(sums[0], sums[1], sums[2], sums[3], issues)
    }

    /// The indicator table (inspection and tests).
    pub fn indicators(&self) -> &[Indicator] {
        &self.indicators
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared default validator for callers that never customize the rubric.
pub fn default_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(Validator::new)
}
