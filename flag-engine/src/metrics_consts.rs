// Evaluation
pub const FLAG_EVALUATION_COUNTER: &str = "flags_evaluation_total";
pub const FLAG_EVALUATION_ERROR_COUNTER: &str = "flags_evaluation_errors_total";
pub const FLAG_EVALUATION_TIME: &str = "flags_evaluation_time";

// Cache
pub const CACHE_INVALIDATIONS_COUNTER: &str = "flags_cache_invalidations_total";
pub const CACHE_ERRORS_COUNTER: &str = "flags_cache_errors_total";

// Storage
pub const DB_FLAG_READS_COUNTER: &str = "flags_db_flag_reads_total";
pub const FLAG_MUTATIONS_COUNTER: &str = "flags_mutations_total";
