use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Historical daily price series, loaded once per process and shared by
/// reference with every market fund (`Arc<MarketData>`). The file format is
/// a bare array of little-endian `f32` samples, one per day.
#[derive(Debug)]
pub struct MarketData {
    samples: Vec<f32>,
}

impl MarketData {
    pub fn load(path: &Path) -> Result<Self, MarketDataError> {
        let bytes = fs::read(path).map_err(|source| MarketDataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if bytes.len() % 4 != 0 {
            return Err(MarketDataError::Truncated {
                path: path.to_path_buf(),
                len: bytes.len(),
            });
        }

        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        if samples.is_empty() {
            return Err(MarketDataError::Empty {
                path: path.to_path_buf(),
            });
        }

        Ok(Self { samples })
    }

    /// Build a series from in-memory samples. The series must be non-empty.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        assert!(!samples.is_empty(), "market series must be non-empty");
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, day: usize) -> f32 {
        self.samples[day]
    }

    /// Ratio of the last sample to the first: the scale applied to the
    /// second tiling of the series.
    pub fn wraparound_multiplier(&self) -> f64 {
        self.samples[self.samples.len() - 1] as f64 / self.samples[0] as f64
    }
}

#[derive(Debug)]
pub enum MarketDataError {
    Io { path: PathBuf, source: io::Error },
    Empty { path: PathBuf },
    Truncated { path: PathBuf, len: usize },
}

impl fmt::Display for MarketDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketDataError::Io { path, source } => {
                write!(f, "failed to read market data '{}': {source}", path.display())
            }
            MarketDataError::Empty { path } => {
                write!(f, "market data '{}' contains no samples", path.display())
            }
            MarketDataError::Truncated { path, len } => write!(
                f,
                "market data '{}' is {len} bytes, not a whole number of f32 samples",
                path.display()
            ),
        }
    }
}

impl std::error::Error for MarketDataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarketDataError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
