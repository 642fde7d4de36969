//! Backoff policies
//!
//! Shared by the retry middleware (delay between attempts) and the
//! circuit breaker (time an opened circuit stays closed to traffic).

use crate::core::timespan::TimeSpan;
use rand::Rng;

/// A delay schedule indexed by 1-based attempt number.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// The same delay for every attempt.
    Constant {
        /// Delay applied on every attempt.
        delay: TimeSpan,
        /// Randomize the delay by +/- 25%.
        jitter: bool,
    },
    /// Delay grows linearly with the attempt number, up to `max`.
    Linear {
        /// Delay of the first attempt.
        base: TimeSpan,
        /// Upper bound on the computed delay.
        max: TimeSpan,
        /// Randomize the delay by +/- 25%.
        jitter: bool,
    },
    /// Delay grows by `factor` per attempt, up to `max`.
    Exponential {
        /// Delay of the first attempt.
        base: TimeSpan,
        /// Growth factor per attempt.
        factor: f64,
        /// Upper bound on the computed delay.
        max: TimeSpan,
        /// Randomize the delay by +/- 25%.
        jitter: bool,
    },
}

impl Backoff {
    /// Constant delay without jitter.
    pub fn constant(delay: TimeSpan) -> Self {
        Backoff::Constant {
            delay,
            jitter: false,
        }
    }

    /// Linear delay without jitter.
    pub fn linear(base: TimeSpan, max: TimeSpan) -> Self {
        Backoff::Linear {
            base,
            max,
            jitter: false,
        }
    }

    /// Exponential delay, doubling per attempt, without jitter.
    pub fn exponential(base: TimeSpan, max: TimeSpan) -> Self {
        Backoff::Exponential {
            base,
            factor: 2.0,
            max,
            jitter: false,
        }
    }

    /// Enable jitter on this policy.
    pub fn with_jitter(mut self) -> Self {
        match &mut self {
            Backoff::Constant { jitter, .. }
            | Backoff::Linear { jitter, .. }
            | Backoff::Exponential { jitter, .. } => *jitter = true,
        }
        self
    }

    /// Compute the delay for `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> TimeSpan {
        let attempt = attempt.max(1);
        let (raw, jitter) = match self {
            Backoff::Constant { delay, jitter } => (*delay, *jitter),
            Backoff::Linear { base, max, jitter } => {
                (base.multiply(attempt as f64).min(*max), *jitter)
            }
            Backoff::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scaled = base.multiply(factor.powi(attempt as i32 - 1));
                (scaled.min(*max), *jitter)
            }
        };

        if jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            raw.multiply(factor).min(self.cap())
        } else {
            raw
        }
    }

    fn cap(&self) -> TimeSpan {
        match self {
            // A jittered constant delay may exceed its nominal value by design of
            // the 25% band, so the cap is the band's upper edge.
            Backoff::Constant { delay, .. } => delay.multiply(1.25),
            Backoff::Linear { max, .. } | Backoff::Exponential { max, .. } => *max,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: TimeSpan::from_millis(100),
            factor: 2.0,
            max: TimeSpan::from_secs(30),
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_delay() {
        let backoff = Backoff::constant(TimeSpan::from_millis(250));
        assert_eq!(backoff.delay(1).as_millis(), 250);
        assert_eq!(backoff.delay(9).as_millis(), 250);
    }

    #[test]
    fn test_linear_delay_is_capped() {
        let backoff = Backoff::linear(TimeSpan::from_millis(100), TimeSpan::from_millis(350));
        assert_eq!(backoff.delay(1).as_millis(), 100);
        assert_eq!(backoff.delay(3).as_millis(), 300);
        assert_eq!(backoff.delay(10).as_millis(), 350);
    }

    #[test]
    fn test_exponential_delay() {
        let backoff = Backoff::exponential(TimeSpan::from_millis(100), TimeSpan::from_secs(10));
        assert_eq!(backoff.delay(1).as_millis(), 100);
        assert_eq!(backoff.delay(2).as_millis(), 200);
        assert_eq!(backoff.delay(4).as_millis(), 800);
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff =
            Backoff::exponential(TimeSpan::from_millis(500), TimeSpan::from_millis(900))
                .with_jitter();
        for attempt in 1..=20 {
            assert!(backoff.delay(attempt).as_millis() <= 900);
        }
    }

    #[test]
    fn test_attempt_zero_is_treated_as_first() {
        let backoff = Backoff::exponential(TimeSpan::from_millis(100), TimeSpan::from_secs(1));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }
}
