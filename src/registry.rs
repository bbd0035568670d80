// Per-channel sample accumulation with synthesized time axes.
//
// The protocol carries no per-sample timestamps. Each burst is spread
// uniformly over the interval since that channel's previous arrival, so
// the first sample of a burst lands on the previous `recv_time`, not on
// the arrival instant. A burst arriving after a long pause therefore
// stretches its timestamps back across the pause; that is inherent to the
// scheme and left as-is.

use log::{info, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One enrolled channel: a numeric sample stream with its derived time
/// axis, plus accumulated text for `Char` channels.
#[derive(Debug, Clone, Default)]
pub struct DataChannel {
    /// Relative time of the most recent arrival, seconds since the
    /// registry time reference.
    pub recv_time: f64,
    pub x_data: Vec<f64>,
    pub y_data: Vec<f64>,
    pub text: String,
}

/// Registry of all enrolled channels, keyed by channel id. Written only
/// by the session worker; readers clone snapshots.
#[derive(Debug, Default)]
pub struct DataRegistry {
    channels: BTreeMap<u8, DataChannel>,
    start_time_ref: f64,
}

fn wall_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty channel, overwriting any previous channel under the
    /// same id.
    pub fn add_channel(&mut self, ch_id: u8) {
        self.channels.insert(ch_id, DataChannel::default());
        info!("channel {ch_id} added");
    }

    pub fn channel_ids(&self) -> Vec<u8> {
        self.channels.keys().copied().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Capture the wall-clock instant all sample timestamps are relative
    /// to. Called when a transfer is requested.
    pub fn set_time_ref(&mut self) {
        self.start_time_ref = wall_seconds();
    }

    /// Append one frame's worth of numeric bursts.
    pub fn append_data<'a>(&mut self, frame_data: impl IntoIterator<Item = (u8, &'a [f64])>) {
        self.append_data_at(wall_seconds(), frame_data);
    }

    pub(crate) fn append_data_at<'a>(
        &mut self,
        wall_now: f64,
        frame_data: impl IntoIterator<Item = (u8, &'a [f64])>,
    ) {
        let relative_time = wall_now - self.start_time_ref;
        for (ch_id, samples) in frame_data {
            let Some(channel) = self.channels.get_mut(&ch_id) else {
                warn!("data for unenrolled channel {ch_id} dropped");
                continue;
            };
            if samples.is_empty() {
                channel.recv_time = relative_time;
                continue;
            }
            // Spread the burst uniformly over the interval since this
            // channel's previous arrival.
            let burst_start = channel.recv_time;
            let full_period = relative_time - burst_start;
            let period = full_period / samples.len() as f64;
            channel
                .x_data
                .extend((0..samples.len()).map(|i| burst_start + period * i as f64));
            channel.y_data.extend_from_slice(samples);
            channel.recv_time = relative_time;
        }
    }

    /// Append one frame's worth of text arrivals, newline-terminated.
    pub fn append_text<'a>(&mut self, frame_text: impl IntoIterator<Item = (u8, &'a str)>) {
        self.append_text_at(wall_seconds(), frame_text);
    }

    pub(crate) fn append_text_at<'a>(
        &mut self,
        wall_now: f64,
        frame_text: impl IntoIterator<Item = (u8, &'a str)>,
    ) {
        let relative_time = wall_now - self.start_time_ref;
        for (ch_id, text) in frame_text {
            let Some(channel) = self.channels.get_mut(&ch_id) else {
                warn!("text for unenrolled channel {ch_id} dropped");
                continue;
            };
            channel.text.push_str(text);
            channel.text.push('\n');
            channel.recv_time = relative_time;
        }
    }

    /// Clone one channel's time and sample axes for a reader.
    pub fn snapshot(&self, ch_id: u8) -> Option<(Vec<f64>, Vec<f64>)> {
        self.channels
            .get(&ch_id)
            .map(|ch| (ch.x_data.clone(), ch.y_data.clone()))
    }

    pub fn text(&self, ch_id: u8) -> Option<String> {
        self.channels.get(&ch_id).map(|ch| ch.text.clone())
    }

    /// Write every non-empty channel to `channel_<id>.csv` / `.txt` in the
    /// working directory. A file that fails to write is reported and the
    /// remaining channels still save.
    pub fn save_data(&self) {
        self.save_data_to(Path::new("."));
    }

    pub fn save_data_to(&self, dir: &Path) {
        for (ch_id, channel) in &self.channels {
            if channel.y_data.is_empty() {
                continue;
            }
            let path = dir.join(format!("channel_{ch_id}.csv"));
            match write_csv(&path, &channel.x_data, &channel.y_data) {
                Ok(()) => info!("data written to {}", path.display()),
                Err(e) => warn!("failed writing {}: {e}", path.display()),
            }
        }
        for (ch_id, channel) in &self.channels {
            if channel.text.is_empty() {
                continue;
            }
            let path = dir.join(format!("channel_{ch_id}.txt"));
            match std::fs::write(&path, &channel.text) {
                Ok(()) => info!("text written to {}", path.display()),
                Err(e) => warn!("failed writing {}: {e}", path.display()),
            }
        }
    }

    /// Empty every channel but keep the enrolment.
    pub fn clear_data(&mut self) {
        for channel in self.channels.values_mut() {
            channel.x_data.clear();
            channel.y_data.clear();
            channel.text.clear();
            channel.recv_time = 0.0;
        }
    }

    /// Drop all channels and the time reference.
    pub fn clear_channels(&mut self) {
        self.channels.clear();
        self.start_time_ref = 0.0;
    }
}

fn write_csv(path: &Path, x_data: &[f64], y_data: &[f64]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for (x, y) in x_data.iter().zip(y_data) {
        writeln!(file, "{x},{y}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_channel() -> DataRegistry {
        let mut registry = DataRegistry::new();
        registry.add_channel(0);
        // Time reference at t = 100 s; tests feed absolute instants.
        registry.start_time_ref = 100.0;
        registry
    }

    #[test]
    fn axes_stay_same_length() {
        let mut registry = registry_with_channel();
        registry.append_data_at(101.0, [(0u8, &[1.0, 2.0, 3.0][..])]);
        registry.append_data_at(102.0, [(0u8, &[4.0][..])]);
        let (x, y) = registry.snapshot(0).unwrap();
        assert_eq!(x.len(), y.len());
        assert_eq!(y, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn burst_spreads_from_previous_arrival() {
        let mut registry = registry_with_channel();
        // Four samples over the first second: period 0.25 starting at 0.
        registry.append_data_at(101.0, [(0u8, &[1.0, 2.0, 3.0, 4.0][..])]);
        let (x, _) = registry.snapshot(0).unwrap();
        assert_eq!(x, vec![0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn timestamps_are_monotonic_within_a_channel() {
        let mut registry = registry_with_channel();
        registry.append_data_at(100.5, [(0u8, &[1.0, 2.0][..])]);
        registry.append_data_at(101.0, [(0u8, &[3.0, 4.0, 5.0][..])]);
        registry.append_data_at(103.0, [(0u8, &[6.0][..])]);
        let (x, _) = registry.snapshot(0).unwrap();
        for pair in x.windows(2) {
            assert!(pair[0] <= pair[1], "{x:?} not monotonic");
        }
        assert!(x.iter().all(|&t| t >= 0.0));
    }

    #[test]
    fn burst_after_pause_stretches_back() {
        // Known property of the timing scheme: a fast burst after a long
        // pause spreads its samples across the pause.
        let mut registry = registry_with_channel();
        registry.append_data_at(101.0, [(0u8, &[1.0][..])]);
        registry.append_data_at(111.0, [(0u8, &[2.0, 3.0][..])]);
        let (x, _) = registry.snapshot(0).unwrap();
        assert_eq!(x, vec![0.0, 1.0, 6.0]);
    }

    #[test]
    fn empty_burst_only_advances_the_clock() {
        let mut registry = registry_with_channel();
        registry.append_data_at(105.0, [(0u8, &[][..])]);
        let (x, y) = registry.snapshot(0).unwrap();
        assert!(x.is_empty() && y.is_empty());
        registry.append_data_at(106.0, [(0u8, &[1.0][..])]);
        let (x, _) = registry.snapshot(0).unwrap();
        assert_eq!(x, vec![5.0]);
    }

    #[test]
    fn unenrolled_channel_is_dropped() {
        let mut registry = registry_with_channel();
        registry.append_data_at(101.0, [(9u8, &[1.0][..])]);
        assert!(registry.snapshot(9).is_none());
        let (x, _) = registry.snapshot(0).unwrap();
        assert!(x.is_empty());
    }

    #[test]
    fn text_accumulates_with_newlines() {
        let mut registry = registry_with_channel();
        registry.append_text_at(101.0, [(0u8, "first")]);
        registry.append_text_at(102.0, [(0u8, "second")]);
        assert_eq!(registry.text(0).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn clear_data_keeps_enrolment() {
        let mut registry = registry_with_channel();
        registry.append_data_at(101.0, [(0u8, &[1.0][..])]);
        registry.append_text_at(101.5, [(0u8, "note")]);
        registry.clear_data();
        let (x, y) = registry.snapshot(0).unwrap();
        assert!(x.is_empty() && y.is_empty());
        assert_eq!(registry.text(0).unwrap(), "");
        assert_eq!(registry.channel_count(), 1);
    }

    #[test]
    fn clear_channels_drops_everything() {
        let mut registry = registry_with_channel();
        registry.clear_channels();
        assert_eq!(registry.channel_count(), 0);
        assert!(registry.snapshot(0).is_none());
    }

    #[test]
    fn add_channel_overwrites_existing() {
        let mut registry = registry_with_channel();
        registry.append_data_at(101.0, [(0u8, &[1.0][..])]);
        registry.add_channel(0);
        let (x, y) = registry.snapshot(0).unwrap();
        assert!(x.is_empty() && y.is_empty());
    }

    #[test]
    fn saves_csv_and_text_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DataRegistry::new();
        registry.add_channel(0);
        registry.add_channel(1);
        registry.add_channel(2);
        registry.start_time_ref = 100.0;
        registry.append_data_at(101.0, [(0u8, &[1.5, 2.5][..])]);
        registry.append_text_at(101.0, [(1u8, "hello")]);
        registry.save_data_to(dir.path());

        let csv = std::fs::read_to_string(dir.path().join("channel_0.csv")).unwrap();
        assert_eq!(csv, "0,1.5\n0.5,2.5\n");
        let txt = std::fs::read_to_string(dir.path().join("channel_1.txt")).unwrap();
        assert_eq!(txt, "hello\n");
        // Channel 2 never produced data; no files for it.
        assert!(!dir.path().join("channel_2.csv").exists());
        assert!(!dir.path().join("channel_2.txt").exists());
    }
}
