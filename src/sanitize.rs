//! Static scan and best-effort strip of dangerous patterns.
//!
//! This is a textual filter, not a parser. `scan` ranks findings by
//! severity; `sanitize` rewrites the handful of patterns worth removing
//! from generated documents and is idempotent on its own output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Severity of a scan finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// One scan finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanIssue {
    pub name: String,
    pub severity: Severity,
    /// The matched text, truncated for readability.
    pub matched: String,
    /// 1-based line of the first match.
    pub line: usize,
}

/// Scan verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// True iff no issue is high or critical.
    pub safe: bool,
    /// Issues ordered by severity rank.
    pub issues: Vec<ScanIssue>,
}

/// Options for [`sanitize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOptions {
    /// Also strip `<script>` blocks entirely.
    pub strip_scripts: bool,
    /// Also strip inline `style` attributes.
    pub strip_inline_styles: bool,
}

/// Result of a sanitize pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeResult {
    pub code: String,
    /// Human-readable descriptions of what was removed.
    pub removed: Vec<String>,
}

struct ScanPattern {
    name: &'static str,
    severity: Severity,
    regex: Regex,
}

fn scan_patterns() -> &'static [ScanPattern] {
    static PATTERNS: OnceLock<Vec<ScanPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ScanPattern {
                name: "eval call",
                severity: Severity::Critical,
                regex: Regex::new(r"\beval\s*\(").unwrap(),
            },
            ScanPattern {
                name: "function constructor",
                severity: Severity::Critical,
                regex: Regex::new(r"\bnew\s+Function\s*\(").unwrap(),
            },
            ScanPattern {
                name: "javascript uri",
                severity: Severity::High,
                regex: Regex::new(r"(?i)(href|src)\s*=\s*['\x22]\s*javascript:").unwrap(),
            },
            ScanPattern {
                name: "iframe embed",
                severity: Severity::High,
                regex: Regex::new(r"(?i)<iframe\b").unwrap(),
            },
            ScanPattern {
                name: "remote script source",
                severity: Severity::Medium,
                regex: Regex::new(r"(?i)<script\b[^>]*\bsrc\s*=").unwrap(),
            },
            ScanPattern {
                name: "document.write",
                severity: Severity::Medium,
                regex: Regex::new(r"document\s*\.\s*write\s*\(").unwrap(),
            },
            ScanPattern {
                name: "cookie access",
                severity: Severity::Low,
                regex: Regex::new(r"document\s*\.\s*cookie").unwrap(),
            },
            ScanPattern {
                name: "window.open",
                severity: Severity::Low,
                regex: Regex::new(r"window\s*\.\s*open\s*\(").unwrap(),
            },
        ]
    })
}

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

/// Scan code for dangerous patterns without modifying it.
pub fn scan(code: &str) -> ScanReport {
    let mut issues: Vec<ScanIssue> = Vec::new();

    for pattern in scan_patterns() {
        if let Some(m) = pattern.regex.find(code) {
            let matched: String = m.as_str().chars().take(60).collect();
            issues.push(ScanIssue {
                name: pattern.name.to_string(),
                severity: pattern.severity,
                matched,
                line: line_of(code, m.start()),
            });
        }
    }

    issues.sort_by_key(|i| i.severity);
    let safe = !issues
        .iter()
        .any(|i| matches!(i.severity, Severity::Critical | Severity::High));

    ScanReport { safe, issues }
}

struct RewritePatterns {
    js_uri: Regex,
    eval_handler_dq: Regex,
    eval_handler_sq: Regex,
    iframe_block: Regex,
    script_block: Regex,
    style_attr: Regex,
}

fn rewrite_patterns() -> &'static RewritePatterns {
    static PATTERNS: OnceLock<RewritePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| RewritePatterns {
        js_uri: Regex::new(r#"(?i)(href|src)(\s*=\s*)(['\x22])\s*javascript:[^'\x22]*(['\x22])"#)
            .unwrap(),
        eval_handler_dq: Regex::new(r#"(?i)\son\w+\s*=\s*\x22[^\x22]*\beval\s*\([^\x22]*\x22"#)
            .unwrap(),
        eval_handler_sq: Regex::new(r"(?i)\son\w+\s*=\s*'[^']*\beval\s*\([^']*'").unwrap(),
        iframe_block: Regex::new(r"(?is)<iframe\b[^>]*>.*?</iframe>|<iframe\b[^>]*/?>").unwrap(),
        script_block: Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap(),
        style_attr: Regex::new(r#"(?i)\sstyle\s*=\s*(\x22[^\x22]*\x22|'[^']*')"#).unwrap(),
    })
}

/// Rewrite dangerous patterns out of the code.
pub fn sanitize(code: &str, opts: SanitizeOptions) -> SanitizeResult {
    let patterns = rewrite_patterns();
    let mut removed = Vec::new();
    let mut out = code.to_string();

    let uri_count = patterns.js_uri.find_iter(&out).count();
    if uri_count > 0 {
        out = patterns.js_uri.replace_all(&out, "$1$2$3#$4").into_owned();
        removed.push(format!("{} javascript: uri(s) neutralized", uri_count));
    }

    let eval_dq = patterns.eval_handler_dq.find_iter(&out).count();
    let eval_sq = patterns.eval_handler_sq.find_iter(&out).count();
    if eval_dq + eval_sq > 0 {
        out = patterns.eval_handler_dq.replace_all(&out, "").into_owned();
        out = patterns.eval_handler_sq.replace_all(&out, "").into_owned();
        removed.push(format!(
            "{} inline handler(s) with eval stripped",
            eval_dq + eval_sq
        ));
    }

    let iframe_count = patterns.iframe_block.find_iter(&out).count();
    if iframe_count > 0 {
        out = patterns.iframe_block.replace_all(&out, "").into_owned();
        removed.push(format!("{} iframe block(s) stripped", iframe_count));
    }

    if opts.strip_scripts {
        let script_count = patterns.script_block.find_iter(&out).count();
        if script_count > 0 {
            out = patterns.script_block.replace_all(&out, "").into_owned();
            removed.push(format!("{} script block(s) stripped", script_count));
        }
    }

    if opts.strip_inline_styles {
        let style_count = patterns.style_attr.find_iter(&out).count();
        if style_count > 0 {
            out = patterns.style_attr.replace_all(&out, "").into_owned();
            removed.push(format!("{} inline style attribute(s) stripped", style_count));
        }
    }

    SanitizeResult { code: out, removed }
}
