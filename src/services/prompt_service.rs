use chrono::{DateTime, Utc};

use crate::models::lockdown_session::Prompt;

const PROMPTS: &[(&str, &str)] = &[
    (
        "prompt-ledger",
        "The quarterly ledger was reconciled before noon, and every invoice that arrived late was flagged for a second review by the finance team.",
    ),
    (
        "prompt-harbor",
        "Fishing boats returned to the harbor at dusk, their crews unloading crates of silver herring while gulls circled above the quiet water.",
    ),
    (
        "prompt-support",
        "Please confirm the delivery address and a contact number so that our support team can schedule the replacement part for next week.",
    ),
    (
        "prompt-archive",
        "Old maps in the city archive show streets that no longer exist, drawn by hand long before anyone imagined satellites or digital surveys.",
    ),
    (
        "prompt-release",
        "The release checklist requires passing tests, updated documentation, and a signed approval from the product owner before deployment.",
    ),
];

/// Picks a prompt from the pool using the clock as a seed. Variety only, not security.
pub fn select_prompt(now: DateTime<Utc>) -> Prompt {
    let idx = (now.timestamp_millis().unsigned_abs() % PROMPTS.len() as u64) as usize;
    let (id, text) = PROMPTS[idx];
    Prompt {
        id: id.to_string(),
        text: text.to_string(),
    }
}

pub fn prompt_pool_size() -> usize {
    PROMPTS.len()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub id: &'static str,
    pub name: &'static str,
    pub duration_sec: u32,
}

const ASSESSMENTS: &[Assessment] = &[
    Assessment {
        id: "typing-speed",
        name: "Typing Speed Assessment",
        duration_sec: 60,
    },
    Assessment {
        id: "typing-endurance",
        name: "Typing Endurance Assessment",
        duration_sec: 180,
    },
];

pub fn find_assessment(id: &str) -> Option<&'static Assessment> {
    ASSESSMENTS.iter().find(|a| a.id == id)
}
