pub mod environment;
pub mod lockdown_event;
pub mod lockdown_session;
