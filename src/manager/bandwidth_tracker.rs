use size::{Size, Style};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
    time::Instant,
};

const BANDWIDTH_POLL_COUNT: usize = 5;

struct BandwidthPoll {
    poll_time: Instant,
    uploaded_bytes: u64,   // total uploaded bytes at this poll
    downloaded_bytes: u64, // total downloaded bytes at this poll
}

/// Rolling transfer rate, fed with the running byte totals on a fixed tick.
///
/// Totals may go down between two polls (a piece failing verification is subtracted from the
/// downloaded bytes), such drops count as no transfer.
pub struct BandwidthTracker {
    bandwidth_polls: VecDeque<BandwidthPoll>,
    rate_up: u64,   // B over the last tick
    rate_down: u64, // B over the last tick
}

impl BandwidthTracker {
    pub fn new() -> Self {
        BandwidthTracker {
            bandwidth_polls: VecDeque::new(),
            rate_up: 0,
            rate_down: 0,
        }
    }

    pub fn update(&mut self, uploaded_bytes: u64, downloaded_bytes: u64) {
        if let Some(latest) = self.bandwidth_polls.front() {
            self.rate_up = uploaded_bytes.saturating_sub(latest.uploaded_bytes);
            self.rate_down = downloaded_bytes.saturating_sub(latest.downloaded_bytes);
        }
        self.bandwidth_polls.push_front(BandwidthPoll {
            poll_time: Instant::now(),
            uploaded_bytes,
            downloaded_bytes,
        });
        if self.bandwidth_polls.len() > BANDWIDTH_POLL_COUNT {
            self.bandwidth_polls.pop_back();
        }
    }

    /// Bytes downloaded during the last tick.
    pub fn rate_down(&self) -> u64 {
        self.rate_down
    }

    /// Bytes uploaded during the last tick.
    pub fn rate_up(&self) -> u64 {
        self.rate_up
    }

    fn avg(&self, bytes: impl Fn(&BandwidthPoll) -> u64) -> f64 {
        let (Some(front), Some(back)) = (self.bandwidth_polls.front(), self.bandwidth_polls.back())
        else {
            return 0.;
        };
        let elapsed = front.poll_time.duration_since(back.poll_time).as_secs_f64();
        if elapsed == 0. {
            return 0.;
        }
        bytes(front).saturating_sub(bytes(back)) as f64 / elapsed
    }

    pub fn avg_bandwidth_down(&self) -> f64 {
        self.avg(|p| p.downloaded_bytes)
    }

    pub fn avg_bandwidth_up(&self) -> f64 {
        self.avg(|p| p.uploaded_bytes)
    }
}

impl Display for BandwidthTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (tot_down, tot_up) = self
            .bandwidth_polls
            .front()
            .map(|p| (p.downloaded_bytes, p.uploaded_bytes))
            .unwrap_or_default();
        write!(
            f,
            "Down: {down_band}/s, Up: {up_band}/s (tot.: {tot_down}, {tot_up})",
            down_band = Size::from_bytes(self.avg_bandwidth_down())
                .format()
                .with_style(Style::Abbreviated),
            up_band = Size::from_bytes(self.avg_bandwidth_up())
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(tot_down)
                .format()
                .with_style(Style::Abbreviated),
            tot_up = Size::from_bytes(tot_up).format().with_style(Style::Abbreviated),
        )
    }
}
