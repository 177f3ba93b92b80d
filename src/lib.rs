//! RESULT SCRAPER
//! Fetches one result page per roll number, extracts the outcome and keeps
//! everything in a single JSON store that can be resumed at any time.

pub mod config;
mod error;
pub mod logging;
mod macros;
pub mod parse;
pub mod persist;
pub mod process;
pub mod progress;
pub mod record;
pub mod registry;
pub mod request;
pub mod retry;
pub mod shutdown;

pub use error::{Error, Result};

const DEFAULT_ROLLS_PATH: &str = "all_rolls.json";
const DEFAULT_STORE_PATH: &str = "all_results.json";
const DEFAULT_ENDPOINT: &str = "http://ntrca.teletalk.com.bd/result/index.php";
const DEFAULT_PROBE_URL: &str = "http://httpbin.org/ip";
const DEFAULT_EXAM: &str = "18:18th:2023:3";
const DEFAULT_CONCURRENCY: usize = 100;
const DEFAULT_MAX_ATTEMPTS: u32 = 30;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FLUSH_IDLE_MS: u64 = 1000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
/// Capacity of the record channel between the workers and the sink.
const RECORD_CHANNEL_CAPACITY: usize = 256;
/// Consecutive failed flushes before the sink starts logging at error level.
const PERSIST_ESCALATE_AFTER: u32 = 3;
