use size::{Size, Style};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
    time::{Duration, SystemTime},
};

// rates are averaged over this many polls
const RATE_WINDOW_POLLS: usize = 4;

struct RatePoll {
    poll_time: SystemTime,
    uploaded_bytes: u64,
    downloaded_bytes: u64,
}

/// Byte counters with a small sliding window of polls to derive transfer
/// rates. One instance tracks the whole engine, one more tracks each peer so
/// the choker can rank peers by what they recently sent us.
pub struct BandwidthTracker {
    polls: VecDeque<RatePoll>,
    uploaded_bytes: u64,
    downloaded_bytes: u64,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        BandwidthTracker {
            polls: VecDeque::new(),
            uploaded_bytes: 0,
            downloaded_bytes: 0,
        }
    }

    pub fn add_uploaded_bytes(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
    }

    pub fn add_downloaded_bytes(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    /// Records the current counters; called once per controller tick.
    pub fn poll(&mut self) {
        self.polls.push_front(RatePoll {
            poll_time: SystemTime::now(),
            uploaded_bytes: self.uploaded_bytes,
            downloaded_bytes: self.downloaded_bytes,
        });
        if self.polls.len() > RATE_WINDOW_POLLS {
            self.polls.pop_back();
        }
    }

    pub fn download_rate(&self) -> f64 {
        self.rate(|p| p.downloaded_bytes)
    }

    pub fn upload_rate(&self) -> f64 {
        self.rate(|p| p.uploaded_bytes)
    }

    fn rate(&self, counter: fn(&RatePoll) -> u64) -> f64 {
        let (front, back) = match (self.polls.front(), self.polls.back()) {
            (Some(front), Some(back)) if self.polls.len() > 1 => (front, back),
            _ => return 0.,
        };
        let window = front
            .poll_time
            .duration_since(back.poll_time)
            .unwrap_or(Duration::from_secs(1)); // clock went backwards, avoid dividing by zero
        (counter(front) - counter(back)) as f64 / window.as_secs_f64().max(f64::EPSILON)
    }
}

impl Display for BandwidthTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Down: {down_band}/s, Up: {up_band}/s (tot.: {tot_down}, {tot_up})",
            down_band = Size::from_bytes(self.download_rate())
                .format()
                .with_style(Style::Abbreviated),
            up_band = Size::from_bytes(self.upload_rate())
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(self.downloaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
            tot_up = Size::from_bytes(self.uploaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
        )
    }
}
