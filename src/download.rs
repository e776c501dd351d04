use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use crate::Error;

/// A source of checkpoint bytes.
pub trait Transport {
    /// Issues one GET. Non-success statuses are errors.
    fn get(&self, url: &str) -> Result<Box<dyn Read>, Error>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, Error> {
        // No total timeout, the body is over a gigabyte.
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Box<dyn Read>, Error> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(Box::new(response))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    AlreadyPresent,
    Downloaded { bytes: u64 },
}

/// Fetches `url` into `destination` unless that path already exists.
pub fn acquire_checkpoint(transport: &dyn Transport, url: &str, destination: &Path, chunk_size: usize) -> Result<CheckpointStatus, Error> {
    if destination.exists() {
        log::info!("Checkpoint found at {}", destination.display());
        return Ok(CheckpointStatus::AlreadyPresent);
    }
    if chunk_size == 0 {
        return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "download chunk size must be positive")));
    }

    log::info!("Downloading Cellpose-SAM checkpoint from {url}...");
    let mut body = transport.get(url)?;
    let mut file = File::create(destination)?;
    let mut buffer = vec![0u8; chunk_size];
    let mut written = 0u64;
    loop {
        let n = match body.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&buffer[..n])?;
        written += n as u64;
    }
    file.flush()?;
    log::info!("Download complete.");
    log::debug!("Wrote {written} bytes to {}", destination.display());
    Ok(CheckpointStatus::Downloaded { bytes: written })
}
