//! WAV file source and WAV frame writers.
//!
//! The source feeds a pipeline from a file; the writers are listeners that
//! persist frames. hound writes the canonical 44-byte PCM header and patches
//! the RIFF and data sizes when the writer is finalized.

use crate::audio::format::AudioFormat;
use crate::defaults;
use crate::error::{DfStreamError, Result};
use crate::pipeline::listener::FrameListener;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Reads a WAV container and hands out fixed-size byte chunks for `push`.
///
/// Only the pipeline's contract format is accepted; nothing is resampled.
pub struct WavFileSource {
    bytes: Vec<u8>,
    position: usize,
    chunk_bytes: usize,
    format: AudioFormat,
}

impl WavFileSource {
    /// Open a WAV file from disk.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Create from any reader (for testing/flexibility).
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader)?;
        let spec = wav_reader.spec();
        let format = AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
            big_endian: false,
        };
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(DfStreamError::UnsupportedFormat {
                expected: AudioFormat::contract().to_string(),
                actual: format!("{format} float"),
            });
        }
        format.validate()?;

        let mut bytes = Vec::with_capacity(wav_reader.len() as usize * defaults::BYTES_PER_SAMPLE);
        for sample in wav_reader.samples::<i16>() {
            bytes.extend_from_slice(&sample?.to_le_bytes());
        }

        Ok(Self {
            bytes,
            position: 0,
            chunk_bytes: defaults::PUSH_CHUNK_BYTES,
            format,
        })
    }

    /// Set the chunk size handed out by `next_chunk`. Zero keeps the default.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        if chunk_bytes > 0 {
            self.chunk_bytes = chunk_bytes;
        }
        self
    }

    /// Next chunk of at most `chunk_bytes` bytes, or None at end of file.
    pub fn next_chunk(&mut self) -> Option<&[u8]> {
        if self.position >= self.bytes.len() {
            return None;
        }
        let end = (self.position + self.chunk_bytes).min(self.bytes.len());
        let chunk = &self.bytes[self.position..end];
        self.position = end;
        Some(chunk)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Total PCM payload in bytes.
    pub fn total_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn duration_ms(&self) -> u64 {
        let samples = (self.bytes.len() / defaults::BYTES_PER_SAMPLE) as u64;
        samples * 1000 / self.format.sample_rate as u64
    }
}

fn contract_spec() -> hound::WavSpec {
    let format = AudioFormat::contract();
    hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Writes frames to a 48 kHz mono 16-bit WAV file.
struct WavSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    bytes_written: u64,
}

impl WavSink {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let writer = hound::WavWriter::create(path, contract_spec())?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            bytes_written: 0,
        })
    }

    fn write(&mut self, frame: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| DfStreamError::InvalidState {
            message: format!("WAV file {} already finalized", self.path.display()),
        })?;
        for pair in frame.chunks_exact(defaults::BYTES_PER_SAMPLE) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            tracing::debug!(
                path = %self.path.display(),
                bytes = self.bytes_written,
                "WAV file finalized"
            );
        }
        Ok(())
    }
}

/// Listener that persists processed frames to a WAV file.
///
/// The header sizes are patched by `finish` (or on drop, best effort).
pub struct WavFrameWriter {
    sink: WavSink,
}

impl WavFrameWriter {
    /// Create the file, including missing parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            sink: WavSink::create(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.sink.path
    }

    /// PCM bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.sink.bytes_written
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.sink.finalize()
    }
}

impl FrameListener for WavFrameWriter {
    fn on_denoised_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.sink.write(frame)
    }

    fn finish(&mut self) -> Result<()> {
        self.finalize()
    }

    fn name(&self) -> &'static str {
        "wav-writer"
    }
}

/// Listener that records the raw input and the processed output side by side.
pub struct DualWavWriter {
    original: WavSink,
    denoised: WavSink,
}

impl DualWavWriter {
    pub fn create(original_path: &Path, denoised_path: &Path) -> Result<Self> {
        Ok(Self {
            original: WavSink::create(original_path)?,
            denoised: WavSink::create(denoised_path)?,
        })
    }

    /// (original, denoised) PCM bytes written so far.
    pub fn bytes_written(&self) -> (u64, u64) {
        (self.original.bytes_written, self.denoised.bytes_written)
    }

    pub fn finalize(&mut self) -> Result<()> {
        let original = self.original.finalize();
        self.denoised.finalize()?;
        original
    }
}

impl FrameListener for DualWavWriter {
    fn on_denoised_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.denoised.write(frame)
    }

    fn on_original_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.original.write(frame)
    }

    fn finish(&mut self) -> Result<()> {
        self.finalize()
    }

    fn name(&self) -> &'static str {
        "dual-wav-writer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::samples_to_bytes;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn source_reads_contract_format() {
        let samples = vec![100i16, -200, 300, -400];
        let wav = make_wav_data(48000, 1, &samples);
        let source = WavFileSource::from_reader(Cursor::new(wav)).unwrap();

        assert_eq!(source.format(), AudioFormat::contract());
        assert_eq!(source.total_bytes(), 8);
        assert_eq!(source.bytes, samples_to_bytes(&samples));
    }

    #[test]
    fn source_rejects_wrong_sample_rate() {
        let wav = make_wav_data(16000, 1, &[0; 16]);
        match WavFileSource::from_reader(Cursor::new(wav)) {
            Err(DfStreamError::UnsupportedFormat { actual, .. }) => {
                assert!(actual.contains("16000"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected UnsupportedFormat"),
        }
    }

    #[test]
    fn source_rejects_stereo() {
        let wav = make_wav_data(48000, 2, &[0; 16]);
        assert!(matches!(
            WavFileSource::from_reader(Cursor::new(wav)),
            Err(DfStreamError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn source_rejects_garbage() {
        let result = WavFileSource::from_reader(Cursor::new(b"not a wav".to_vec()));
        assert!(matches!(result, Err(DfStreamError::Wav(_))));
    }

    #[test]
    fn source_chunks_cover_all_bytes() {
        let wav = make_wav_data(48000, 1, &[7i16; 1000]);
        let mut source = WavFileSource::from_reader(Cursor::new(wav))
            .unwrap()
            .with_chunk_bytes(300);

        let mut sizes = Vec::new();
        while let Some(chunk) = source.next_chunk() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes.iter().sum::<usize>(), 2000);
        assert!(sizes[..sizes.len() - 1].iter().all(|&s| s == 300));
        assert_eq!(*sizes.last().unwrap(), 200);
    }

    #[test]
    fn source_duration() {
        let wav = make_wav_data(48000, 1, &vec![0i16; 48000]);
        let source = WavFileSource::from_reader(Cursor::new(wav)).unwrap();
        assert_eq!(source.duration_ms(), 1000);
    }

    #[test]
    fn frame_writer_creates_parent_dirs_and_patches_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out/denoised.wav");
        let mut writer = WavFrameWriter::create(&path).unwrap();

        let samples: Vec<i16> = (0..480).map(|i| i as i16).collect();
        writer.on_denoised_frame(&samples_to_bytes(&samples)).unwrap();
        writer.on_denoised_frame(&samples_to_bytes(&samples)).unwrap();
        assert_eq!(writer.bytes_written(), 1920);
        writer.finish().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 44 + 1920);
        assert_eq!(&raw[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), 36 + 1920);
        assert_eq!(&raw[36..40], b"data");
        assert_eq!(u32::from_le_bytes([raw[40], raw[41], raw[42], raw[43]]), 1920);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.len(), 960);
    }

    #[test]
    fn frame_writer_rejects_writes_after_finish() {
        let dir = TempDir::new().unwrap();
        let mut writer = WavFrameWriter::create(&dir.path().join("a.wav")).unwrap();
        writer.finish().unwrap();
        // Second finish is a no-op.
        writer.finish().unwrap();
        assert!(matches!(
            writer.on_denoised_frame(&[0, 0]),
            Err(DfStreamError::InvalidState { .. })
        ));
    }

    #[test]
    fn dual_writer_splits_streams() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("original.wav");
        let denoised = dir.path().join("denoised.wav");
        let mut writer = DualWavWriter::create(&original, &denoised).unwrap();

        writer.on_original_frame(&samples_to_bytes(&[1, 2, 3])).unwrap();
        writer.on_denoised_frame(&samples_to_bytes(&[4, 5])).unwrap();
        assert_eq!(writer.bytes_written(), (6, 4));
        writer.finish().unwrap();

        let original_samples: Vec<i16> = hound::WavReader::open(&original)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        let denoised_samples: Vec<i16> = hound::WavReader::open(&denoised)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(original_samples, vec![1, 2, 3]);
        assert_eq!(denoised_samples, vec![4, 5]);
    }
}
