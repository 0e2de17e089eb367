//! Deterministic prompt assembly.
//!
//! `enhance` turns a raw intent plus ambient context into the structured
//! prompt sent to providers; `system_instruction` builds the per-provider
//! system prompt. Both are pure string builders: no network, no clock,
//! no filesystem.

use serde::{Deserialize, Serialize};

use crate::router::ProviderKind;

/// Visual style preset applied to the generated app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StylePreset {
    Cyberpunk,
    #[default]
    Minimal,
    Terminal,
}

impl StylePreset {
    /// Parse a preset name; unknown names fall back to minimal.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cyberpunk" => Self::Cyberpunk,
            "terminal" => Self::Terminal,
            _ => Self::Minimal,
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            Self::Cyberpunk => {
                "Style: neon-on-dark cyberpunk. Saturated accent colors over deep \
                 backgrounds, glow effects, angular layout, monospace numerals."
            }
            Self::Minimal => {
                "Style: clean minimal. Generous whitespace, a restrained palette with \
                 one accent color, soft shadows, system font stack."
            }
            Self::Terminal => {
                "Style: retro terminal. Monospace everywhere, phosphor green or amber \
                 on near-black, box-drawing borders, blinking cursor accents."
            }
        }
    }
}

impl std::fmt::Display for StylePreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cyberpunk => write!(f, "cyberpunk"),
            Self::Minimal => write!(f, "minimal"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Inputs to [`enhance`] beyond the intent itself.
#[derive(Debug, Clone, Default)]
pub struct EnhanceOptions {
    pub style: StylePreset,
    /// BCP-47-ish language for UI copy; defaults to English.
    pub language: Option<String>,
    /// Joined context-probe hints, one per line.
    pub context_block: Option<String>,
    /// One-line hint about the user's taste, from the profile store.
    pub profile_hint: Option<String>,
    /// Optional authorial persona for the generated copy.
    pub persona: Option<String>,
}

/// Build the enhanced prompt. Deterministic: identical inputs produce
/// identical output.
pub fn enhance(intent: &str, opts: &EnhanceOptions) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str("Build a complete, self-contained HTML application for this intent:\n\n");
    prompt.push_str(intent.trim());
    prompt.push_str("\n\n");

    prompt.push_str(opts.style.guidance());
    prompt.push('\n');

    if let Some(language) = opts.language.as_deref().filter(|l| !l.trim().is_empty()) {
        prompt.push_str(&format!("All user-facing copy in: {}.\n", language.trim()));
    }

    if let Some(context) = opts.context_block.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\nAmbient context (weave in where it helps, never quote verbatim):\n");
        for line in context.trim().lines() {
            prompt.push_str("- ");
            prompt.push_str(line.trim());
            prompt.push('\n');
        }
    }

    if let Some(hint) = opts.profile_hint.as_deref().filter(|h| !h.trim().is_empty()) {
        prompt.push_str(&format!("\nUser taste: {}.\n", hint.trim()));
    }

    if let Some(persona) = opts.persona.as_deref().filter(|p| !p.trim().is_empty()) {
        prompt.push_str(&format!("\nWrite all copy in the voice of: {}.\n", persona.trim()));
    }

    prompt.push_str(
        "\nThe app must work offline from a single file, persist state across \
         reloads, and feel finished: real interactions, real styling, sensible \
         empty states.\n",
    );

    prompt
}

/// Build the system instruction for a provider.
///
/// The contract is identical everywhere; the framing is tuned per
/// provider family (local models need the blunter phrasing).
pub fn system_instruction(provider: ProviderKind, style: StylePreset) -> String {
    let mut out = String::with_capacity(768);

    out.push_str("You are an expert front-end engineer generating one complete HTML file.\n");
    out.push_str("Hard requirements:\n");
    out.push_str("- Output ONLY the HTML document. No prose, no explanations.\n");
    out.push_str("- Never wrap the output in markdown code fences.\n");
    out.push_str("- Begin with <!DOCTYPE html> and end with </html>.\n");
    out.push_str("- Fully self-contained: inline all CSS and JavaScript.\n");
    out.push_str("- No external dependencies: no CDNs, no fonts, no fetch calls.\n");
    out.push_str("- Persist user data with localStorage.\n");
    out.push_str(
        "Quality bar: interactive controls with working handlers; sound document \
         structure with error handling; deliberate visual design with motion; \
         semantic, accessible markup.\n",
    );
    out.push_str(&format!("Visual direction: {}.\n", style));

    match provider {
        ProviderKind::Ollama => {
            out.push_str("Respond with the raw HTML file content and nothing else.\n");
        }
        ProviderKind::Anthropic => {
            out.push_str("Skip any preamble; the first character of your reply is '<'.\n");
        }
        ProviderKind::Gemini | ProviderKind::OpenAiCompat => {}
    }

    out
}
