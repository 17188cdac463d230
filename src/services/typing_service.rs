use crate::models::lockdown_session::{KeystrokeCadence, TypingScore};

#[derive(Debug, Clone, Default)]
pub struct TypingInput<'a> {
    pub prompt_text: &'a str,
    pub typed_text: &'a str,
    pub duration_sec: u32,
    pub backspace_count: u32,
    pub keystroke_intervals_ms: &'a [u32],
}

pub struct TypingService;

impl TypingService {
    /// Deterministic WPM/accuracy scoring. A zero duration is scored as one second.
    pub fn calculate_wpm_score(input: &TypingInput<'_>) -> TypingScore {
        let prompt: Vec<char> = input.prompt_text.chars().collect();
        let typed: Vec<char> = input.typed_text.chars().collect();

        let overlap = prompt.len().min(typed.len());
        let correct = prompt
            .iter()
            .zip(typed.iter())
            .take(overlap)
            .filter(|(p, t)| p == t)
            .count();
        let mismatches = overlap - correct;
        let extra = typed.len().saturating_sub(prompt.len());
        let missing = prompt.len().saturating_sub(typed.len());
        let total_errors = mismatches + extra + missing;

        let duration_sec = input.duration_sec.max(1);
        let minutes = duration_sec as f64 / 60.0;
        let gross_wpm = (typed.len() as f64 / 5.0) / minutes;
        let net_wpm = (gross_wpm - total_errors as f64 / minutes).max(0.0);
        let accuracy = if typed.is_empty() {
            0.0
        } else {
            correct as f64 / typed.len() as f64 * 100.0
        };

        TypingScore {
            gross_wpm: round2(gross_wpm),
            net_wpm: round2(net_wpm),
            accuracy: round2(accuracy),
            typed_characters: typed.len() as u32,
            correct_characters: correct as u32,
            mismatches: mismatches as u32,
            extra_characters: extra as u32,
            missing_characters: missing as u32,
            total_errors: total_errors as u32,
            backspace_count: input.backspace_count,
            duration_sec,
            cadence: Self::keystroke_cadence(input.keystroke_intervals_ms),
        }
    }

    pub fn keystroke_cadence(intervals_ms: &[u32]) -> KeystrokeCadence {
        if intervals_ms.is_empty() {
            return KeystrokeCadence::default();
        }
        let n = intervals_ms.len() as f64;
        let mean = intervals_ms.iter().map(|v| *v as f64).sum::<f64>() / n;
        let variance = intervals_ms
            .iter()
            .map(|v| {
                let d = *v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let min = intervals_ms.iter().copied().min().unwrap_or(0);
        let max = intervals_ms.iter().copied().max().unwrap_or(0);

        KeystrokeCadence {
            keystrokes: intervals_ms.len() as u32 + 1,
            mean_interval_ms: round2(mean),
            stddev_interval_ms: round2(variance.sqrt()),
            min_interval_ms: min as f64,
            max_interval_ms: max as f64,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
