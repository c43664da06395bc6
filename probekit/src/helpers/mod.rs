pub mod logger;
pub(crate) mod rate_limit;
pub(crate) mod signals;
pub(crate) mod time;
