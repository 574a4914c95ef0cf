// Binary persistence for frame archives
//
// One file per source, big-endian throughout:
//
//   i32  frame_count
//   per record:
//     i64  julian day number
//     u32  milliseconds since midnight
//     i32  cols, i32 rows, i32 pixel type tag
//     u8[cols * rows * bytes_per_pixel]  raw pixels
//
// Loading parses into a scratch list and only hands records over once the
// whole file has been read, so a cancelled or corrupt load leaves the live
// archive untouched.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};

use super::archive::{FrameArchive, FrameRecord};
use crate::capture::{Frame, PixelFormat};

/// Julian day number of 0000-12-31 (proleptic Gregorian), so that
/// `num_days_from_ce() + offset` is the Julian day of a date
const JULIAN_DAY_OFFSET: i64 = 1_721_425;

const MS_PER_DAY: u32 = 86_400_000;

/// Largest frame edge accepted when reading
const MAX_DIMENSION: i32 = 16_384;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive corrupt at record {record}: {reason}")]
    Corrupt { record: usize, reason: String },

    #[error("Archive load cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Write every record of `archive` to `writer`
pub fn write_archive<W: Write>(writer: &mut W, archive: &FrameArchive) -> Result<()> {
    let count = i32::try_from(archive.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "too many frames for archive format")
    })?;
    writer.write_all(&count.to_be_bytes())?;

    for record in archive.records() {
        write_record(writer, record)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_record<W: Write>(writer: &mut W, record: &FrameRecord) -> Result<()> {
    let julian_day = record.date.num_days_from_ce() as i64 + JULIAN_DAY_OFFSET;
    let ms = record.time.num_seconds_from_midnight() * 1000 + record.time.nanosecond() / 1_000_000;
    let frame = &record.frame;

    writer.write_all(&julian_day.to_be_bytes())?;
    writer.write_all(&ms.min(MS_PER_DAY - 1).to_be_bytes())?;
    writer.write_all(&(frame.width() as i32).to_be_bytes())?;
    writer.write_all(&(frame.height() as i32).to_be_bytes())?;
    writer.write_all(&frame.format().type_tag().to_be_bytes())?;
    writer.write_all(frame.data())?;
    Ok(())
}

/// Persist `archive` to `path`, replacing it atomically
pub fn save_archive(archive: &FrameArchive, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("dat.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        if let Err(e) = write_archive(&mut writer, archive) {
            drop(writer);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
    }
    std::fs::rename(&tmp_path, path)?;

    log::info!(
        "[Archive] Saved {} frames to {}",
        archive.len(),
        path.display()
    );
    Ok(())
}

/// Counts bytes pulled through the underlying reader
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Read records from `reader`.
///
/// `total_bytes` is the stream length used for progress and sanity checks
/// (0 if unknown). `progress` is called after each record with
/// `(bytes_consumed, total_bytes)`. `cancel` is polled before each record.
pub fn read_archive<R: Read>(
    reader: R,
    total_bytes: u64,
    progress: &mut dyn FnMut(u64, u64),
    cancel: &AtomicBool,
) -> Result<Vec<FrameRecord>> {
    let mut reader = CountingReader { inner: reader, consumed: 0 };

    let count = read_i32(&mut reader, 0)?;
    if count < 0 {
        return Err(corrupt(0, format!("negative frame count {}", count)));
    }

    let mut records = Vec::with_capacity((count as usize).min(4096));
    for index in 0..count as usize {
        if cancel.load(Ordering::Relaxed) {
            return Err(ArchiveError::Cancelled);
        }
        records.push(read_record(&mut reader, index, total_bytes)?);
        progress(reader.consumed, total_bytes);
    }

    Ok(records)
}

fn read_record<R: Read>(
    reader: &mut CountingReader<R>,
    index: usize,
    total_bytes: u64,
) -> Result<FrameRecord> {
    let julian_day = read_i64(reader, index)?;
    let ms = read_u32(reader, index)?;
    let cols = read_i32(reader, index)?;
    let rows = read_i32(reader, index)?;
    let tag = read_i32(reader, index)?;

    let date = i32::try_from(julian_day - JULIAN_DAY_OFFSET)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or_else(|| corrupt(index, format!("invalid julian day {}", julian_day)))?;
    if ms >= MS_PER_DAY {
        return Err(corrupt(index, format!("invalid time {}ms", ms)));
    }
    let time = NaiveTime::from_num_seconds_from_midnight_opt(ms / 1000, (ms % 1000) * 1_000_000)
        .ok_or_else(|| corrupt(index, format!("invalid time {}ms", ms)))?;

    if !(1..=MAX_DIMENSION).contains(&cols) || !(1..=MAX_DIMENSION).contains(&rows) {
        return Err(corrupt(index, format!("invalid dimensions {}x{}", cols, rows)));
    }
    let format = PixelFormat::from_type_tag(tag)
        .ok_or_else(|| corrupt(index, format!("unknown pixel type {}", tag)))?;

    let len = cols as usize * rows as usize * format.bytes_per_pixel();
    if total_bytes > 0 && reader.consumed + len as u64 > total_bytes {
        return Err(corrupt(index, "pixel data runs past end of file".into()));
    }

    let mut data = vec![0u8; len];
    read_exact(reader, &mut data, index)?;

    let frame = Frame::new(cols as u32, rows as u32, format, data)
        .ok_or_else(|| corrupt(index, "pixel buffer size mismatch".into()))?;
    Ok(FrameRecord::new(date, time, Arc::new(frame)))
}

/// Load an archive file without touching any live archive
pub fn load_archive(
    path: &Path,
    progress: &mut dyn FnMut(u64, u64),
    cancel: &AtomicBool,
) -> Result<Vec<FrameRecord>> {
    let file = File::open(path)?;
    let total = file.metadata()?.len();
    read_archive(BufReader::new(file), total, progress, cancel)
}

/// Load `path` and append its records to `archive`. Returns the number restored.
pub fn restore_into(
    archive: &mut FrameArchive,
    path: &Path,
    progress: &mut dyn FnMut(u64, u64),
    cancel: &AtomicBool,
) -> Result<usize> {
    let records = load_archive(path, progress, cancel)?;
    let count = records.len();
    archive.extend(records);
    Ok(count)
}

fn corrupt(record: usize, reason: String) -> ArchiveError {
    ArchiveError::Corrupt { record, reason }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], index: usize) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => corrupt(index, "unexpected end of file".into()),
        _ => ArchiveError::Io(e),
    })
}

fn read_i32<R: Read>(reader: &mut R, index: usize) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, index)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R, index: usize) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, index)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R, index: usize) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, index)?;
    Ok(i64::from_be_bytes(buf))
}
