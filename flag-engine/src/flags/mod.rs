pub mod evaluation_cache;
pub mod flag_models;
pub mod flag_service;
pub mod override_resolver;
