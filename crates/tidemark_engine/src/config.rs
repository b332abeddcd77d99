//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use tidemark_protocol::Clause;

/// What the Upload phase does after one entity fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadPolicy {
    /// Keep uploading the remaining entities and report every failure.
    #[default]
    ContinueOnError,
    /// Start no further uploads once one fails. Requests already in flight
    /// still complete and are accounted for.
    AbortOnFirstError,
}

/// How a downloaded object is applied over a row with unsynced local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The downloaded object always overwrites the local row.
    #[default]
    ServerWins,
    /// A row edited locally since the last sync keeps its local values and
    /// is uploaded later in the same cycle.
    ClientWins,
    /// The newer of the local edit time and the remote modification time
    /// wins.
    LastWriteWins,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Watermark scope key; one per synchronized entity type and collection.
    pub scope: String,
    /// Remote collection (bucket) name.
    pub collection: String,
    /// Caller-supplied filter conjoined with the remote modified-time bound.
    pub base_clause: Option<Clause>,
    /// Requested download page size; `None` uses the remote default.
    pub page_size: Option<u32>,
    /// Maximum number of upload requests in flight.
    pub upload_concurrency: usize,
    /// Upload failure policy.
    pub upload_policy: UploadPolicy,
    /// Download conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Per-request timeout for remote calls.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            collection: collection.into(),
            base_clause: None,
            page_size: None,
            upload_concurrency: 4,
            upload_policy: UploadPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the base filter clause.
    pub fn with_base_clause(mut self, clause: Clause) -> Self {
        self.base_clause = Some(clause);
        self
    }

    /// Sets the download page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Sets the upload concurrency. Values below 1 are treated as 1.
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    /// Sets the upload failure policy.
    pub fn with_upload_policy(mut self, policy: UploadPolicy) -> Self {
        self.upload_policy = policy;
        self
    }

    /// Sets the download conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Backoff between whole sync cycles in [`crate::SyncEngine::sync_with_retry`].
///
/// A failed cycle is rerun from `Downloading`; single requests are never
/// retried on their own. Only errors with [`crate::SyncError::is_retryable`]
/// start another cycle.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of cycles per call, including the first.
    pub max_attempts: u32,
    /// Wait before the second cycle.
    pub initial_delay: Duration,
    /// Upper bound on any wait.
    pub max_delay: Duration,
    /// Factor applied to the wait after each further failed cycle.
    pub backoff_multiplier: f64,
    /// Adds up to a quarter of the wait again, at random.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Allows up to `max_attempts` cycles, starting at a 100 ms wait that
    /// doubles up to 30 s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Runs a single cycle and reports its error as is.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the wait before the second cycle.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps every wait at `delay`.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor between consecutive waits.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Wait before rerunning the cycle after `failed_cycles` failures.
    /// Zero failures means no wait.
    pub fn delay_for_attempt(&self, failed_cycles: u32) -> Duration {
        let Some(exponent) = failed_cycles.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let wait = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = wait * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(wait + jitter)
        } else {
            Duration::from_secs_f64(wait)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
