//! Digest parsing and the streaming verifying reader (size + digest
//! enforcement on every read).

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

/// Recognized digest algorithms. SHA-256 is canonical; SHA-512 is accepted.
/// Anything else fails with [`Error::UnsupportedDigestAlgorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            Algorithm::Sha256 => MessageDigest::sha256(),
            Algorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::UnsupportedDigestAlgorithm(other.to_string())),
        }
    }
}

/// An algorithm-qualified digest: `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: Algorithm,
    pub hex: String,
}

impl Digest {
    pub fn compute(algorithm: Algorithm, bytes: &[u8]) -> Result<Self> {
        let mut hasher = Hasher::new(algorithm.message_digest())?;
        hasher.update(bytes)?;
        let hex = hex::encode(hasher.finish()?);
        Ok(Self { algorithm, hex })
    }

    /// The relative path a CAS rooted at `blobs/` stores this digest under.
    pub fn blob_path(&self) -> String {
        format!("blobs/{}/{}", self.algorithm.name(), self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::UnsupportedDigestAlgorithm(s.to_string()))?;
        Ok(Self {
            algorithm: alg.parse()?,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

enum State {
    Reading,
    Verified,
    Failed,
}

/// Wraps a reader and enforces a descriptor's declared `size` and `digest`
/// as bytes flow through. Finalizes transparently the moment the inner
/// reader reports EOF at exactly `size` bytes read — a plain `io::copy`
/// into a sink is enough to get the full size+digest contract enforced.
pub struct Verifier<R> {
    inner: R,
    hasher: Hasher,
    expected: Digest,
    size: u64,
    read: u64,
    state: State,
}

impl<R: Read> Verifier<R> {
    pub fn new(inner: R, descriptor: &Descriptor) -> Result<Self> {
        let hasher = Hasher::new(descriptor.digest.algorithm.message_digest())?;
        Ok(Self {
            inner,
            hasher,
            expected: descriptor.digest.clone(),
            size: descriptor.size,
            read: 0,
            state: State::Reading,
        })
    }

    /// Finalize verification. Valid to call once `size` bytes have been
    /// read; returns [`Error::EarlyVerify`] otherwise.
    pub fn verify(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.state {
            State::Verified => return Ok(()),
            State::Failed => return Err(Error::MismatchedDigest {
                expected: self.expected.to_string(),
                found: String::new(),
            }),
            State::Reading => {}
        }
        if self.read != self.size {
            return Err(Error::EarlyVerify);
        }
        // probe for trailing data
        let mut probe = [0u8; 1];
        let n = self.inner.read(&mut probe).map_err(Error::Io)?;
        if n != 0 {
            self.state = State::Failed;
            return Err(Error::TrailingData { size: self.size });
        }
        let found_raw = self.hasher.finish()?;
        let found = hex::encode(found_raw);
        if found != self.expected.hex {
            self.state = State::Failed;
            return Err(Error::MismatchedDigest {
                expected: self.expected.to_string(),
                found: format!("{}:{}", self.expected.algorithm.name(), found),
            });
        }
        self.state = State::Verified;
        Ok(())
    }
}

impl<R: Read> Read for Verifier<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if matches!(self.state, State::Failed) {
            return Ok(0);
        }
        let remaining = self.size.saturating_sub(self.read);
        if remaining == 0 {
            // At declared size: finalize (digest check + trailing-data probe)
            // on this call so a plain io::copy enforces the full contract.
            return self.finish().map(|_| 0).map_err(io::Error::from);
        }
        let cap = remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..cap])?;
        if n == 0 {
            // Inner EOF before declared size: leave unverified: a
            // subsequent explicit verify() call will report EarlyVerify.
            return Ok(0);
        }
        self.hasher.update(&buf[..n])?;
        self.read += n as u64;
        // Don't finalize here even if read == size: let the caller's next
        // read() (or an explicit verify()) trigger the EOF/trailing-data
        // probe, so a reader that stops exactly at `size` without another
        // read() call can still finalize via verify().
        Ok(n)
    }
}

/// Stream-hash `reader` to completion, returning its digest and byte count
/// without buffering the whole content in memory.
pub fn hash_reader<R: Read>(algorithm: Algorithm, mut reader: R) -> Result<(Digest, u64)> {
    let mut hasher = Hasher::new(algorithm.message_digest())?;
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
        size += n as u64;
    }
    let hex = hex::encode(hasher.finish()?);
    Ok((Digest { algorithm, hex }, size))
}

/// Read exactly `descriptor.size` bytes from `reader` and verify them
/// against `descriptor`, returning the bytes.
pub fn read_all<R: Read>(reader: R, descriptor: &Descriptor) -> Result<Vec<u8>> {
    if descriptor.size > i64::MAX as u64 {
        return Err(Error::InvalidDescriptorSize(descriptor.size as i64));
    }
    let mut verifier = Verifier::new(reader, descriptor)?;
    let mut buf = vec![0u8; descriptor.size as usize];
    verifier.read_exact(&mut buf).map_err(|e| {
        e.into_inner()
            .and_then(|b| b.downcast::<Error>().ok())
            .map(|b| *b)
            .unwrap_or_else(|| Error::Io(io::Error::new(e.kind(), e.to_string())))
    })?;
    verifier.verify()?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{descriptor_from_bytes, MEDIA_TYPE_IMAGE_LAYER};
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"hello world").unwrap();
        let bytes = read_all(Cursor::new(b"hello world".to_vec()), &desc).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn mismatched_digest() {
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"foo").unwrap();
        let err = read_all(Cursor::new(b"bar".to_vec()), &desc).unwrap_err();
        assert!(matches!(err, Error::MismatchedDigest { .. }));
    }

    #[test]
    fn trailing_data() {
        let mut desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"hello").unwrap();
        desc.size = 5;
        let data = b"hello world more".to_vec(); // 16 bytes total, declared size 5
        let err = read_all(Cursor::new(data), &desc).unwrap_err();
        assert!(matches!(err, Error::TrailingData { .. }));
    }

    #[test]
    fn unsupported_algorithm() {
        let err: Result<Algorithm> = "md5".parse();
        assert!(matches!(err, Err(Error::UnsupportedDigestAlgorithm(_))));
    }
}
