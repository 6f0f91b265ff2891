pub mod backoff;

pub mod process;

pub mod time;
