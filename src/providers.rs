//! Candidate custodians and the selection policy used when hiring.
//!
//! Custodian identities arrive in two shapes: the raw 32-byte key as 64 hex
//! characters (optionally prefixed with a workchain, `0:<hex>`), and the
//! 48-character base64 "friendly" address that wraps the same key with flags,
//! workchain and checksum. Exclusion compares the underlying key, so both
//! spellings of one custodian are the same custodian.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use rand::Rng;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Well-known public storage providers used when none are configured.
pub const KNOWN_PROVIDERS: [&str; 8] = [
    "EQCtCEcQeulPvo89ohIySxB0XT0RdON_7c9qkziic59G9mg6",
    "EQDJlWIX-7HcN-7RqDhFhpuCfbHLruOMJ2p4hKKr_AN7_R9S",
    "EQBQZHQElR4NsG1LpxcgDs28uan8mC4oIRdxJcnmHdYKxKWC",
    "EQD6bNCmOioAWowK6ee5f0_wt_9ZVEK2_4h0dbSfUqxtJdC3",
    "EQDSDRwBN8vv0TvGRd9dh7Cq9B_EToqCWNmQHJS7UlDA82y7",
    "EQDqtIbnphcjx310zHrn7o9FwD-ToWTb1psIH5IDoyEadQsB",
    "EQDrqJ_AbapwD-38KOI8qJmbLexmmxKbh2ngYs95Lq2A8Uw7",
    "EQDKX25ZfT6rik45LBXoxXMycfBJDw-TV256wF6ZmNAEjoz0",
];

const FRIENDLY_ADDR_LEN: usize = 48;
const FRIENDLY_ADDR_BYTES: usize = 36;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("raw key is not valid hex")]
    Hex,
    #[error("friendly address is not valid base64")]
    Base64,
    #[error("unrecognised address length {0}")]
    Length(usize),
}

/// The 32-byte key that identifies a custodian regardless of spelling.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CustodianKey([u8; 32]);

impl CustodianKey {
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(AddressError::Empty);
        }

        // Raw form, with or without a `<workchain>:` prefix.
        let raw = addr.rsplit_once(':').map(|(_, key)| key).unwrap_or(addr);
        if raw.len() == 64 {
            let bytes = hex::decode(raw).map_err(|_| AddressError::Hex)?;
            return Self::from_slice(&bytes);
        }

        if addr.len() == FRIENDLY_ADDR_LEN {
            let decoded = URL_SAFE
                .decode(addr)
                .or_else(|_| STANDARD.decode(addr))
                .map_err(|_| AddressError::Base64)?;
            if decoded.len() != FRIENDLY_ADDR_BYTES {
                return Err(AddressError::Length(decoded.len()));
            }
            // flags, workchain, 32-byte key, crc16
            return Self::from_slice(&decoded[2..34]);
        }

        Err(AddressError::Length(addr.len()))
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::Length(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CustodianKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustodianKey({})", self.to_hex())
    }
}

/// Identity used for exclusion: the parsed key when possible, otherwise the
/// trimmed text so unparseable entries still exclude themselves.
#[derive(Debug, PartialEq, Eq)]
enum Identity {
    Key(CustodianKey),
    Text(String),
}

impl Identity {
    fn of(addr: &str) -> Self {
        match CustodianKey::parse(addr) {
            Ok(key) => Self::Key(key),
            Err(_) => Self::Text(addr.trim().to_string()),
        }
    }
}

/// Whether two address strings name the same custodian.
pub fn same_custodian(a: &str, b: &str) -> bool {
    Identity::of(a) == Identity::of(b)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no providers configured")]
    Empty,
    #[error("no available providers left (all {0} known providers are already used)")]
    Exhausted(usize),
}

/// Known candidate custodians plus the exhaustion policy.
#[derive(Debug, Clone)]
pub struct ProviderDirectory {
    candidates: Vec<String>,
    reuse_when_exhausted: bool,
}

impl ProviderDirectory {
    pub fn new(candidates: Vec<String>, reuse_when_exhausted: bool) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(candidates.len());
        for addr in candidates {
            let addr = addr.trim().to_string();
            if addr.is_empty() {
                continue;
            }
            if let Err(err) = CustodianKey::parse(&addr) {
                warn!(address = %addr, error = %err, "provider address not recognised; comparing it verbatim");
            }
            if !unique.iter().any(|known| same_custodian(known, &addr)) {
                unique.push(addr);
            }
        }
        Self {
            candidates: unique,
            reuse_when_exhausted,
        }
    }

    /// Directory seeded with [`KNOWN_PROVIDERS`].
    pub fn well_known(reuse_when_exhausted: bool) -> Self {
        Self::new(
            KNOWN_PROVIDERS.iter().map(|s| s.to_string()).collect(),
            reuse_when_exhausted,
        )
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Pick a custodian uniformly at random among those not in `exclude`.
    ///
    /// When every candidate is excluded the directory either fails with
    /// [`ProviderError::Exhausted`] or, if reuse is enabled, picks uniformly
    /// from the full list: a duplicate custodian beats no replica at all.
    pub fn find_candidate<R: Rng + ?Sized>(
        &self,
        exclude: &[String],
        rng: &mut R,
    ) -> Result<String, ProviderError> {
        if self.candidates.is_empty() {
            return Err(ProviderError::Empty);
        }

        let excluded: Vec<Identity> = exclude.iter().map(|a| Identity::of(a)).collect();
        let available: Vec<&String> = self
            .candidates
            .iter()
            .filter(|c| !excluded.contains(&Identity::of(c)))
            .collect();

        if !available.is_empty() {
            let pick = rng.gen_range(0..available.len());
            return Ok(available[pick].clone());
        }

        if self.reuse_when_exhausted {
            let pick = rng.gen_range(0..self.candidates.len());
            warn!(
                provider = %self.candidates[pick],
                "all providers already used; reusing one"
            );
            return Ok(self.candidates[pick].clone());
        }

        Err(ProviderError::Exhausted(self.candidates.len()))
    }
}
