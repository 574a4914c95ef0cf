// Time-indexed frame archive
//
// Every source keeps an append-only sequence of timestamped frames addressed by
// absolute position. Positions keep counting up for the lifetime of the source:
// pruning and byte-cap eviction advance `first_index` instead of renumbering,
// so indices held by the recording trigger stay meaningful.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveTime};

use crate::capture::Frame;

/// One archived frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub frame: Arc<Frame>,
}

impl FrameRecord {
    pub fn new(date: NaiveDate, time: NaiveTime, frame: Arc<Frame>) -> Self {
        Self { date, time, frame }
    }

    pub fn now(frame: Arc<Frame>) -> Self {
        let now = Local::now().naive_local();
        Self::new(now.date(), now.time(), frame)
    }

    pub fn timestamp(&self) -> chrono::NaiveDateTime {
        self.date.and_time(self.time)
    }
}

/// Rolling archive for one source
pub struct FrameArchive {
    records: VecDeque<FrameRecord>,
    /// Absolute index of `records[0]`
    first_index: u64,
    /// Pixel bytes currently held
    bytes: usize,
    /// Eviction threshold in pixel bytes (0 = unbounded)
    max_bytes: usize,
}

impl FrameArchive {
    pub fn new() -> Self {
        Self::with_max_bytes(0)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            records: VecDeque::new(),
            first_index: 0,
            bytes: 0,
            max_bytes,
        }
    }

    /// Append a record and return its index
    pub fn append(&mut self, record: FrameRecord) -> u64 {
        let index = self.next_index();
        self.bytes += record.frame.byte_len();
        self.records.push_back(record);
        self.evict_over_budget();
        index
    }

    /// Append a frame stamped with the current local date and time
    pub fn append_now(&mut self, frame: Arc<Frame>) -> u64 {
        self.append(FrameRecord::now(frame))
    }

    /// Oldest frames go first; the newest frame is always kept
    fn evict_over_budget(&mut self) {
        if self.max_bytes == 0 {
            return;
        }
        while self.bytes > self.max_bytes && self.records.len() > 1 {
            self.pop_front();
        }
    }

    fn pop_front(&mut self) -> Option<FrameRecord> {
        let record = self.records.pop_front()?;
        self.bytes -= record.frame.byte_len();
        self.first_index += 1;
        Some(record)
    }

    pub fn get(&self, index: u64) -> Option<&FrameRecord> {
        let offset = index.checked_sub(self.first_index)?;
        self.records.get(offset as usize)
    }

    /// Records `start..=end`. `None` if the range is inverted or not fully retained.
    pub fn range(&self, start: u64, end: u64) -> Option<Vec<FrameRecord>> {
        if !self.contains_range(start, end) {
            return None;
        }
        let from = (start - self.first_index) as usize;
        let to = (end - self.first_index) as usize;
        Some(self.records.range(from..=to).cloned().collect())
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        end >= start && start >= self.first_index && end < self.next_index()
    }

    pub fn latest(&self) -> Option<&FrameRecord> {
        self.records.back()
    }

    /// Index of the newest record
    pub fn latest_index(&self) -> Option<u64> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.next_index() - 1)
        }
    }

    /// Drop every record dated before `older_than`. Returns how many were removed.
    ///
    /// Records are in arrival order, so this trims from the front and stops at the
    /// first record that is recent enough.
    pub fn prune(&mut self, older_than: NaiveDate) -> usize {
        let mut removed = 0;
        while self
            .records
            .front()
            .map(|r| r.date < older_than)
            .unwrap_or(false)
        {
            self.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index the next appended record will get
    pub fn next_index(&self) -> u64 {
        self.first_index + self.records.len() as u64
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn records(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter()
    }

    /// Distinct calendar dates present, oldest first
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = Vec::new();
        for record in &self.records {
            if !dates.contains(&record.date) {
                dates.push(record.date);
            }
        }
        dates.sort();
        dates
    }

    /// First and last index archived on `date`
    pub fn date_span(&self, date: NaiveDate) -> Option<(u64, u64)> {
        let first = self.records.iter().position(|r| r.date == date)?;
        let last = self.records.iter().rposition(|r| r.date == date)?;
        Some((self.first_index + first as u64, self.first_index + last as u64))
    }

    /// Append restored records after whatever is already held
    pub(crate) fn extend(&mut self, records: Vec<FrameRecord>) {
        for record in records {
            self.append(record);
        }
    }
}

impl Default for FrameArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};

    fn frame(value: u8) -> Arc<Frame> {
        Arc::new(Frame::new(2, 2, PixelFormat::Gray8, vec![value; 4]).unwrap())
    }

    fn record(day: u32, value: u8) -> FrameRecord {
        FrameRecord::new(
            NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            NaiveTime::from_hms_opt(12, 0, value as u32 % 60).unwrap(),
            frame(value),
        )
    }

    #[test]
    fn indices_are_monotonic_across_prune() {
        let mut archive = FrameArchive::new();
        for (i, day) in [1, 1, 2, 3, 3].into_iter().enumerate() {
            assert_eq!(archive.append(record(day, i as u8)), i as u64);
        }

        let removed = archive.prune(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
        assert_eq!(removed, 3);
        assert_eq!(archive.first_index(), 3);
        assert_eq!(archive.len(), 2);
        assert!(archive.get(2).is_none());
        assert_eq!(archive.get(3).unwrap().frame.data()[0], 3);
        assert_eq!(archive.append(record(4, 9)), 5);
    }

    #[test]
    fn range_is_inclusive_and_bounded() {
        let mut archive = FrameArchive::new();
        for i in 0..10 {
            archive.append(record(1, i));
        }

        let frames = archive.range(2, 4).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame.data()[0], 2);
        assert_eq!(frames[2].frame.data()[0], 4);

        assert!(archive.range(4, 2).is_none());
        assert!(archive.range(5, 10).is_none());
        assert!(archive.range(9, 9).is_some());
    }

    #[test]
    fn byte_cap_evicts_oldest_frames() {
        let mut archive = FrameArchive::with_max_bytes(10);
        for i in 0..5 {
            archive.append(record(1, i));
        }
        // 4 bytes per frame: only two fit under 10 bytes
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.first_index(), 3);
        assert_eq!(archive.byte_len(), 8);
        assert_eq!(archive.latest_index(), Some(4));
    }

    #[test]
    fn dates_and_spans_describe_each_day() {
        let mut archive = FrameArchive::new();
        for (i, day) in [5, 5, 6, 6, 6, 7].into_iter().enumerate() {
            archive.append(record(day, i as u8));
        }

        let days: Vec<u32> = archive.dates().iter().map(|d| chrono::Datelike::day(d)).collect();
        assert_eq!(days, vec![5, 6, 7]);
        assert_eq!(
            archive.date_span(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()),
            Some((2, 4))
        );
        assert_eq!(archive.date_span(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()), None);
    }

    #[test]
    fn empty_archive_has_no_latest() {
        let archive = FrameArchive::new();
        assert!(archive.latest().is_none());
        assert_eq!(archive.latest_index(), None);
        assert_eq!(archive.next_index(), 0);
    }
}
