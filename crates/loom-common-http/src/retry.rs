// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Transient-failure classification and backoff delays.

use std::time::Duration;

/// Errors that can tell whether repeating the same request may succeed.
pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() || self.is_request() {
			return true;
		}
		self.status().map(|s| is_retryable_status(s.as_u16())).unwrap_or(false)
	}
}

/// Returns true for statuses that indicate the server may accept the same
/// payload later: request timeout, rate limiting and server-side failures.
pub fn is_retryable_status(status: u16) -> bool {
	matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
	pub base: Duration,
	pub max: Duration,
	pub jitter: bool,
}

impl Default for Backoff {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			max: Duration::from_secs(60),
			jitter: true,
		}
	}
}

impl Backoff {
	/// Delay before the next attempt after `failures` consecutive failures.
	///
	/// Grows as `base * 2^(failures - 1)`, capped at `max`. Zero failures
	/// means no delay.
	pub fn delay(&self, failures: u32) -> Duration {
		if failures == 0 {
			return Duration::ZERO;
		}
		let exp = (failures - 1).min(16);
		let delay = self.base.saturating_mul(1u32 << exp).min(self.max);
		if self.jitter && !delay.is_zero() {
			// Up to 10% extra so a fleet of clients does not retry in lockstep.
			let extra = delay.mul_f64(fastrand::f64() * 0.1);
			(delay + extra).min(self.max)
		} else {
			delay
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn retryable_statuses() {
		for status in [408, 429, 500, 502, 503, 504, 599] {
			assert!(is_retryable_status(status), "status {status} should be retryable");
		}
	}

	#[test]
	fn non_retryable_statuses() {
		for status in [200, 400, 401, 403, 404, 413, 422] {
			assert!(
				!is_retryable_status(status),
				"status {status} should not be retryable"
			);
		}
	}

	#[test]
	fn backoff_doubles_until_capped() {
		let backoff = Backoff {
			jitter: false,
			..Backoff::default()
		};
		assert_eq!(backoff.delay(0), Duration::ZERO);
		assert_eq!(backoff.delay(1), Duration::from_secs(1));
		assert_eq!(backoff.delay(2), Duration::from_secs(2));
		assert_eq!(backoff.delay(4), Duration::from_secs(8));
		assert_eq!(backoff.delay(7), Duration::from_secs(60));
		assert_eq!(backoff.delay(40), Duration::from_secs(60));
	}

	proptest! {
		#[test]
		fn backoff_never_exceeds_max(failures in 0u32..200) {
			let backoff = Backoff::default();
			prop_assert!(backoff.delay(failures) <= backoff.max);
		}
	}
}
