use rand::{distributions::Alphanumeric, thread_rng, Rng};

pub const SESSION_ID_PREFIX: &str = "lds_";
const SESSION_ID_RANDOM_LEN: usize = 32;

pub fn random_alphanumeric(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Opaque, unguessable lockdown session id.
pub fn generate_session_id() -> String {
    format!("{}{}", SESSION_ID_PREFIX, random_alphanumeric(SESSION_ID_RANDOM_LEN))
}
