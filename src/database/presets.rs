//! Built-in prompt presets seeded on first start.
//!
//! All presets share the response contract parsed by the classifier:
//! `{"classifications":[{"sequence_num":N,"label":"ad"|"content","confidence":0.0-1.0,"rationale":"..."}]}`

use anyhow::Result;
use rusqlite::{params, Connection};

const RESPONSE_FORMAT: &str = r#"## Input
Each transcript line is formatted as `[SEQUENCE] [START-END] text`, times in seconds.

## Output
Respond ONLY with JSON, no prose:
{"classifications":[{"sequence_num":SEQUENCE,"label":"ad","confidence":SCORE,"rationale":"short reason"}]}

Only list segments you label "ad". Segments you leave out are treated as content.
If there are no ads: {"classifications":[]}

When an ad read spans several lines, label every line of the read, including the
lead-in ("this episode is brought to you by") and the closing call to action."#;

pub const DEFAULT_USER_PROMPT_TEMPLATE: &str = "This is the podcast {{podcast_title}}.\n\nTranscript excerpt follows:\n\n{{transcript}}\n";

struct PresetSeed {
    name: &'static str,
    aggressiveness: &'static str,
    intro: &'static str,
    min_confidence: f64,
    is_active: bool,
}

const SEEDS: [PresetSeed; 3] = [
    PresetSeed {
        name: "Conservative",
        aggressiveness: "conservative",
        intro: "You detect ONLY unmistakable, scripted advertisements in podcast transcripts: \
                sponsor reads naming a company and pitching a product, promo codes, discount \
                offers and explicit \"brought to you by\" segments. Casual product mentions, \
                guest plugs and teases for this show are content. When in doubt, do not flag.",
        min_confidence: 0.8,
        is_active: false,
    },
    PresetSeed {
        name: "Balanced",
        aggressiveness: "balanced",
        intro: "You detect advertisements and promotional content in podcast transcripts while \
                preserving genuine discussion: sponsor reads, ad-break transitions, promo codes, \
                special URLs, network cross-promotions and scripted host-read ads are ads. \
                Organic conversation, guest introductions and listener mail are content.",
        min_confidence: 0.7,
        is_active: true,
    },
    PresetSeed {
        name: "Aggressive",
        aggressiveness: "aggressive",
        intro: "You detect all promotional content in podcast transcripts: sponsor reads, \
                host-read ads, self-promotion, membership and donation pitches, merchandise and \
                \"rate and review\" requests. Prefer flagging when a segment is mostly promotional.",
        min_confidence: 0.6,
        is_active: false,
    },
];

/// Insert the built-in presets if they are missing. Existing rows (and the
/// operator's choice of active preset) are left alone.
pub fn seed_presets(conn: &Connection) -> Result<()> {
    let has_active: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM prompt_presets WHERE is_active = 1)",
        [],
        |row| row.get(0),
    )?;

    for seed in &SEEDS {
        let system_prompt = format!("{}\n\n{}", seed.intro, RESPONSE_FORMAT);
        conn.execute(
            "INSERT OR IGNORE INTO prompt_presets
                (name, aggressiveness, system_prompt, user_prompt_template, min_confidence, is_active)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                seed.name,
                seed.aggressiveness,
                system_prompt,
                DEFAULT_USER_PROMPT_TEMPLATE,
                seed.min_confidence,
                seed.is_active && !has_active,
            ],
        )?;
    }
    Ok(())
}
