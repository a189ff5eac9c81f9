//! Retry policies: decide whether a failed attempt retries and how long
//! to wait before the next one.
//!
//! A policy combines a retry budget, optional error-kind allow/deny
//! filters, and a backoff family. Delay computation is deterministic
//! unless jitter is enabled; jittered paths take the randomness source as
//! an argument so tests can seed it.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

/// Fraction of the computed delay that jitter may add or remove.
const JITTER_RATIO: f64 = 0.2;

/// Delay computation family for a retry policy.
#[derive(Clone)]
pub enum Backoff {
    /// Never retry; the delay is never consulted.
    None,
    /// Constant delay between attempts.
    Fixed { delay: f64 },
    /// `base_delay * backoff_factor^(attempt - 1)`, optionally capped.
    Exponential {
        base_delay: f64,
        backoff_factor: f64,
        max_delay: Option<f64>,
        jitter: bool,
    },
    /// `initial_delay + increment * (attempt - 1)`, optionally capped.
    Linear {
        initial_delay: f64,
        increment: f64,
        max_delay: Option<f64>,
        jitter: bool,
    },
    /// Caller-supplied `attempt -> seconds` function, used verbatim
    /// (no capping or jitter unless the function applies its own).
    Custom(Arc<dyn Fn(u32) -> f64 + Send + Sync>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::None => write!(f, "None"),
            Backoff::Fixed { delay } => f.debug_struct("Fixed").field("delay", delay).finish(),
            Backoff::Exponential {
                base_delay,
                backoff_factor,
                max_delay,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("base_delay", base_delay)
                .field("backoff_factor", backoff_factor)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            Backoff::Linear {
                initial_delay,
                increment,
                max_delay,
                jitter,
            } => f
                .debug_struct("Linear")
                .field("initial_delay", initial_delay)
                .field("increment", increment)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            Backoff::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Retry policy for a job: budget, error-kind filters, backoff family.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_on: Option<Vec<String>>,
    ignore_on: Option<Vec<String>>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_on: None,
            ignore_on: None,
            backoff: Backoff::None,
        }
    }

    /// Constant `delay_secs` between attempts.
    pub fn fixed(max_retries: u32, delay_secs: f64) -> Self {
        Self {
            max_retries,
            retry_on: None,
            ignore_on: None,
            backoff: Backoff::Fixed { delay: delay_secs },
        }
    }

    /// Exponential backoff: `base_delay * backoff_factor^(attempt - 1)`.
    pub fn exponential(max_retries: u32, base_delay: f64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            retry_on: None,
            ignore_on: None,
            backoff: Backoff::Exponential {
                base_delay,
                backoff_factor,
                max_delay: None,
                jitter: false,
            },
        }
    }

    /// Linear backoff: `initial_delay + increment * (attempt - 1)`.
    pub fn linear(max_retries: u32, initial_delay: f64, increment: f64) -> Self {
        Self {
            max_retries,
            retry_on: None,
            ignore_on: None,
            backoff: Backoff::Linear {
                initial_delay,
                increment,
                max_delay: None,
                jitter: false,
            },
        }
    }

    /// Delegate delay computation to `f`, called with the attempt number.
    pub fn custom(max_retries: u32, f: impl Fn(u32) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            max_retries,
            retry_on: None,
            ignore_on: None,
            backoff: Backoff::Custom(Arc::new(f)),
        }
    }

    /// Cap computed delays at `secs`. Only exponential and linear backoff
    /// support a cap; other families are unchanged.
    pub fn with_max_delay(mut self, secs: f64) -> Self {
        match &mut self.backoff {
            Backoff::Exponential { max_delay, .. } | Backoff::Linear { max_delay, .. } => {
                *max_delay = Some(secs);
            }
            _ => {}
        }
        self
    }

    /// Randomize computed delays uniformly within ±20%. Only exponential
    /// and linear backoff support jitter.
    pub fn with_jitter(mut self) -> Self {
        match &mut self.backoff {
            Backoff::Exponential { jitter, .. } | Backoff::Linear { jitter, .. } => {
                *jitter = true;
            }
            _ => {}
        }
        self
    }

    /// Only the listed error kinds are retryable.
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// The listed error kinds are never retried; checked before the
    /// `retry_on` allowlist.
    pub fn ignore_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_on = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether attempt `attempt` failing with `error_kind` should retry.
    pub fn should_retry(&self, error_kind: &str, attempt: u32) -> bool {
        if let Some(ignore) = &self.ignore_on {
            if ignore.iter().any(|k| k == error_kind) {
                return false;
            }
        }
        if let Some(retry) = &self.retry_on {
            if !retry.iter().any(|k| k == error_kind) {
                return false;
            }
        }
        attempt < self.max_retries
    }

    /// Delay in seconds to wait after attempt `attempt` fails.
    ///
    /// # Panics
    ///
    /// Attempt numbering starts at 1; calling with 0 is a programmer
    /// error and panics.
    pub fn get_delay(&self, attempt: u32) -> f64 {
        self.get_delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Like [`get_delay`](Self::get_delay) with an injected randomness
    /// source, so jittered delays are reproducible in tests.
    pub fn get_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> f64 {
        assert!(attempt >= 1, "retry attempt numbering starts at 1");
        match &self.backoff {
            Backoff::None => 0.0,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                base_delay,
                backoff_factor,
                max_delay,
                jitter,
            } => {
                let mut delay = base_delay * backoff_factor.powi(attempt as i32 - 1);
                if let Some(cap) = max_delay {
                    delay = delay.min(*cap);
                }
                if *jitter {
                    delay = apply_jitter(delay, rng);
                }
                delay
            }
            Backoff::Linear {
                initial_delay,
                increment,
                max_delay,
                jitter,
            } => {
                let mut delay = initial_delay + increment * f64::from(attempt - 1);
                if let Some(cap) = max_delay {
                    delay = delay.min(*cap);
                }
                if *jitter {
                    delay = apply_jitter(delay, rng);
                }
                delay
            }
            Backoff::Custom(f) => (f.as_ref())(attempt),
        }
    }
}

fn apply_jitter<R: Rng>(delay: f64, rng: &mut R) -> f64 {
    delay * rng.gen_range(1.0 - JITTER_RATIO..=1.0 + JITTER_RATIO)
}
