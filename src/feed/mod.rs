//! Realtime job run feed
//!
//! Every committed JobRun insert, transition, or progress update is
//! published as a `JobRunEvent` on channel `job_runs:{symbol}:{timeframe}`.
//! Subscribers pick the pairs they care about with a `FeedFilter`.

use crate::db::sqlite::models::{JobRun, JobStatus};
use crate::market::Timeframe;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// One change to a job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunEvent {
    pub channel: String,
    /// None for a freshly inserted run
    pub previous_status: Option<JobStatus>,
    /// Includes `failed-exhausted`
    pub status: String,
    pub run: JobRun,
    pub emitted_at: DateTime<Utc>,
}

pub fn channel_name(symbol: &str, timeframe: Timeframe) -> String {
    format!("job_runs:{}:{}", symbol, timeframe)
}

/// Which events a subscriber receives; empty fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedFilter {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
}

impl FeedFilter {
    pub fn matches(&self, event: &JobRunEvent) -> bool {
        self.symbol
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case(&event.run.symbol))
            && self.timeframe.map_or(true, |tf| tf == event.run.timeframe)
    }
}

/// Broadcast hub for job run events
#[derive(Debug, Clone)]
pub struct JobFeed {
    sender: broadcast::Sender<JobRunEvent>,
}

impl JobFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a change. Returns the number of subscribers reached.
    pub fn publish(&self, previous_status: Option<JobStatus>, run: &JobRun, now: DateTime<Utc>) -> usize {
        let event = JobRunEvent {
            channel: channel_name(&run.symbol, run.timeframe),
            previous_status,
            status: run.reported_status().to_string(),
            run: run.clone(),
            emitted_at: now,
        };
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: FeedFilter) -> JobFeedSubscription {
        JobFeedSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Filtered receiving end of the feed
pub struct JobFeedSubscription {
    receiver: broadcast::Receiver<JobRunEvent>,
    filter: FeedFilter,
}

impl JobFeedSubscription {
    /// Next matching event; `None` once the feed is closed. Slow consumers
    /// skip what they missed rather than erroring out.
    pub async fn recv(&mut self) -> Option<JobRunEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Job feed subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`
    pub fn try_recv(&mut self) -> Option<JobRunEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobRunEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::{JobType, TriggerSource};
    use chrono::TimeZone;
    use futures_util::StreamExt;

    fn run(symbol: &str, timeframe: Timeframe, status: JobStatus) -> JobRun {
        let t = Utc.with_ymd_and_hms(2026, 10, 14, 13, 0, 0).unwrap();
        JobRun {
            id: 1,
            job_definition_id: 1,
            symbol: symbol.to_string(),
            timeframe,
            job_type: JobType::FetchIntraday,
            slice_start: t,
            slice_end: t,
            status,
            attempt: 1,
            max_attempts: 1,
            priority: 0,
            triggered_by: TriggerSource::Tick,
            provider: None,
            rows_written: 0,
            progress_percent: 0.0,
            error_code: None,
            error_message: None,
            next_eligible_at: None,
            created_at: t,
            started_at: None,
            finished_at: None,
            updated_at: t,
        }
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let feed = JobFeed::default();
        let mut aapl = feed.subscribe(FeedFilter {
            symbol: Some("aapl".to_string()),
            timeframe: Some(Timeframe::H1),
        });
        let now = Utc::now();

        feed.publish(None, &run("MSFT", Timeframe::H1, JobStatus::Queued), now);
        feed.publish(None, &run("AAPL", Timeframe::M5, JobStatus::Queued), now);
        feed.publish(Some(JobStatus::Running), &run("AAPL", Timeframe::H1, JobStatus::Failed), now);

        let event = aapl.recv().await.unwrap();
        assert_eq!(event.channel, "job_runs:AAPL:1h");
        assert_eq!(event.previous_status, Some(JobStatus::Running));
        // max_attempts = 1, so the failure is terminal
        assert_eq!(event.status, "failed-exhausted");
        assert!(aapl.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_feed_dropped() {
        let feed = JobFeed::new(8);
        let sub = feed.subscribe(FeedFilter::default());
        feed.publish(None, &run("AAPL", Timeframe::H1, JobStatus::Queued), Utc::now());
        drop(feed);

        let events: Vec<JobRunEvent> = sub.into_stream().collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = JobFeed::default();
        assert_eq!(feed.publish(None, &run("AAPL", Timeframe::H1, JobStatus::Queued), Utc::now()), 0);
    }
}
