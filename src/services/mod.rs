pub mod integrity_service;
pub mod lockdown_service;
pub mod policy_service;
pub mod prompt_service;
pub mod typing_service;
