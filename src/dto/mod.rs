pub mod lockdown_dto;
