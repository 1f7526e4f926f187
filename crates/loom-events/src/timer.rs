// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background timers.
//!
//! Timers never touch delivery state directly. They only post jobs to the
//! worker, so they behave the same in headless processes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::worker::{Job, JobQueue};

/// Periodic flush trigger.
pub(crate) struct FlushTimer {
	handle: JoinHandle<()>,
}

impl FlushTimer {
	pub fn start(period: Duration, jobs: JobQueue) -> Self {
		info!(flush_interval_ms = period.as_millis() as u64, "Starting flush timer");
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			// The first tick completes immediately.
			interval.tick().await;
			loop {
				interval.tick().await;
				if jobs.send(Job::FlushTick).is_err() {
					debug!("Worker gone, stopping flush timer");
					break;
				}
			}
		});
		Self { handle }
	}

	pub fn stop(self) {
		info!("Stopping flush timer");
		self.handle.abort();
	}
}

impl Drop for FlushTimer {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Posts a single job after a delay unless cancelled first.
pub(crate) struct OneShotTimer {
	handle: JoinHandle<()>,
}

impl OneShotTimer {
	pub fn schedule(delay: Duration, jobs: JobQueue, job: Job) -> Self {
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = jobs.send(job);
		});
		Self { handle }
	}

	pub fn cancel(self) {
		self.handle.abort();
	}
}

impl Drop for OneShotTimer {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn flush_timer_ticks_after_each_period() {
		let (jobs, mut rx) = JobQueue::channel();
		let timer = FlushTimer::start(Duration::from_secs(30), jobs);

		tokio::time::sleep(Duration::from_secs(29)).await;
		assert!(rx.try_recv().is_err());

		tokio::time::sleep(Duration::from_secs(2)).await;
		assert!(matches!(rx.try_recv(), Ok(Job::FlushTick)));

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert!(matches!(rx.try_recv(), Ok(Job::FlushTick)));

		timer.stop();
		tokio::time::sleep(Duration::from_secs(120)).await;
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn one_shot_fires_once() {
		let (jobs, mut rx) = JobQueue::channel();
		let _timer = OneShotTimer::schedule(Duration::from_secs(5), jobs, Job::IdentifyBatchElapsed);
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert!(matches!(rx.try_recv(), Ok(Job::IdentifyBatchElapsed)));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_one_shot_never_fires() {
		let (jobs, mut rx) = JobQueue::channel();
		let timer = OneShotTimer::schedule(Duration::from_secs(5), jobs, Job::IdentifyBatchElapsed);
		timer.cancel();
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert!(rx.try_recv().is_err());
	}
}
