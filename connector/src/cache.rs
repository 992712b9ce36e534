//! Persisted instrument token lists, one JSON file per venue, refreshed when
//! older than the configured TTL. The adapter resolves symbols to venue
//! tokens from here at subscription time.

use std::{fs, io, path::PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use std::collections::HashMap;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Io: {0}")]
    Io(#[from] io::Error),
    #[error("Parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CachedInstrument {
    pub symbol: String,
    pub token: u32,
    pub exchange: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheFile {
    /// Unix seconds at fetch time.
    fetched_at: i64,
    instruments: Vec<CachedInstrument>,
}

pub struct InstrumentStore {
    dir: PathBuf,
    ttl_hours: u64,
}

impl InstrumentStore {
    pub fn new<P: Into<PathBuf>>(dir: P, ttl_hours: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl_hours,
        }
    }

    fn path_for(&self, venue: &str) -> PathBuf {
        self.dir.join(format!("{}.json", venue.to_lowercase()))
    }

    /// Loads the venue's token list; `None` when the cache is missing or
    /// older than the TTL.
    pub fn load(&self, venue: &str) -> Result<Option<Vec<CachedInstrument>>, CacheError> {
        let path = self.path_for(venue);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(?path, "no instrument cache");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        let file: CacheFile = serde_json::from_str(&raw)?;
        let age_hours = (Utc::now().timestamp() - file.fetched_at).max(0) as u64 / 3600;
        if age_hours >= self.ttl_hours {
            info!(venue, age_hours, "instrument cache expired");
            return Ok(None);
        }
        Ok(Some(file.instruments))
    }

    pub fn store(&self, venue: &str, instruments: &[CachedInstrument]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let file = CacheFile {
            fetched_at: Utc::now().timestamp(),
            instruments: instruments.to_vec(),
        };
        fs::write(self.path_for(venue), serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// Collapses a token list into the symbol → token map the adapter consumes.
pub fn token_map(instruments: &[CachedInstrument]) -> HashMap<String, u32> {
    instruments
        .iter()
        .map(|instrument| (instrument.symbol.clone(), instrument.token))
        .collect()
}
