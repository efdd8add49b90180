//! Bit-exact value encodings for the host/core boundary.
//!
//! Every import the core calls returns either a [`Pair`] or an
//! [`AbiResult`], packed into one wide integer. Two packings exist and they
//! are not interchangeable, so a runtime picks one [`PairEncoding`] and uses
//! it for every import.

use std::io;

use serde::Deserialize;
use thiserror::Error;

/// Largest integer a double-precision float represents exactly (2^53 - 1).
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

const SAFE_LOW_BITS: u32 = 31;
const SAFE_LOW_MASK: u64 = (1 << SAFE_LOW_BITS) - 1;
const SAFE_HIGH_MAX: u64 = MAX_SAFE_INTEGER >> SAFE_LOW_BITS;

const TAG_OK: u32 = 0;
const TAG_ERR: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("pair half {value} does not fit in {bits} bits")]
    HalfOutOfRange { value: u32, bits: u32 },
    #[error("packed value {0:#x} is not a valid pair for this encoding")]
    InvalidPacked(u64),
    #[error("result tag {0} is neither ok (0) nor err (1)")]
    InvalidTag(u32),
}

/// The packing scheme shared by both sides of the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairEncoding {
    /// 32-bit low half, 32-bit high half, for hosts with native 64-bit integers.
    #[default]
    Wide,
    /// 31-bit low half and up to 22-bit high half, so the packed value stays
    /// below 2^53 and survives a round trip through a double.
    Safe,
}

impl PairEncoding {
    /// Largest value the second half of a [`Pair`] can carry.
    #[must_use]
    pub const fn max_second(self) -> u32 {
        match self {
            Self::Wide => u32::MAX,
            Self::Safe => SAFE_HIGH_MAX as u32,
        }
    }
}

/// Two unsigned integers packed into one wide integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub first: u32,
    pub second: u32,
}

impl Pair {
    #[must_use]
    pub const fn new(first: u32, second: u32) -> Self {
        Self { first, second }
    }

    pub fn encode(self, encoding: PairEncoding) -> Result<u64, AbiError> {
        match encoding {
            PairEncoding::Wide => Ok(u64::from(self.first) | (u64::from(self.second) << 32)),
            PairEncoding::Safe => {
                if u64::from(self.first) > SAFE_LOW_MASK {
                    return Err(AbiError::HalfOutOfRange {
                        value: self.first,
                        bits: SAFE_LOW_BITS,
                    });
                }
                if u64::from(self.second) > SAFE_HIGH_MAX {
                    return Err(AbiError::HalfOutOfRange {
                        value: self.second,
                        bits: 53 - SAFE_LOW_BITS,
                    });
                }
                Ok(u64::from(self.first) | (u64::from(self.second) << SAFE_LOW_BITS))
            }
        }
    }

    pub fn decode(packed: u64, encoding: PairEncoding) -> Result<Self, AbiError> {
        match encoding {
            PairEncoding::Wide => Ok(Self {
                first: (packed & 0xFFFF_FFFF) as u32,
                second: (packed >> 32) as u32,
            }),
            PairEncoding::Safe => {
                if packed > MAX_SAFE_INTEGER {
                    return Err(AbiError::InvalidPacked(packed));
                }
                Ok(Self {
                    first: (packed & SAFE_LOW_MASK) as u32,
                    second: (packed >> SAFE_LOW_BITS) as u32,
                })
            }
        }
    }
}

/// A value-or-errno result in the [`Pair`] shape: the upper half is the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiResult {
    Ok(u32),
    Err(Errno),
}

impl AbiResult {
    pub fn encode(self, encoding: PairEncoding) -> Result<u64, AbiError> {
        let pair = match self {
            Self::Ok(value) => Pair::new(value, TAG_OK),
            Self::Err(errno) => Pair::new(errno.code(), TAG_ERR),
        };
        pair.encode(encoding)
    }

    pub fn decode(packed: u64, encoding: PairEncoding) -> Result<Self, AbiError> {
        let pair = Pair::decode(packed, encoding)?;
        match pair.second {
            TAG_OK => Ok(Self::Ok(pair.first)),
            TAG_ERR => Ok(Self::Err(Errno::from_code(pair.first))),
            tag => Err(AbiError::InvalidTag(tag)),
        }
    }
}

impl From<Result<u32, Errno>> for AbiResult {
    fn from(value: Result<u32, Errno>) -> Self {
        match value {
            Ok(value) => Self::Ok(value),
            Err(errno) => Self::Err(errno),
        }
    }
}

/// POSIX-style error codes returned to the core as the error half of an
/// [`AbiResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Errno {
    #[error("operation not permitted")]
    Perm,
    #[error("no such file or directory")]
    NoEnt,
    #[error("input/output error")]
    Io,
    #[error("bad handle")]
    BadF,
    #[error("permission denied")]
    Access,
    #[error("bad address")]
    Fault,
    #[error("already exists")]
    Exist,
    #[error("invalid argument")]
    Inval,
    #[error("buffer too small")]
    Range,
    #[error("function not implemented")]
    NoSys,
    #[error("operation not supported")]
    NotSup,
    #[error("timed out")]
    TimedOut,
    #[error("errno {0}")]
    Other(u32),
}

impl Errno {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Perm => 1,
            Self::NoEnt => 2,
            Self::Io => 5,
            Self::BadF => 9,
            Self::Access => 13,
            Self::Fault => 14,
            Self::Exist => 17,
            Self::Inval => 22,
            Self::Range => 34,
            Self::NoSys => 38,
            Self::NotSup => 95,
            Self::TimedOut => 110,
            Self::Other(code) => code,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Perm,
            2 => Self::NoEnt,
            5 => Self::Io,
            9 => Self::BadF,
            13 => Self::Access,
            14 => Self::Fault,
            17 => Self::Exist,
            22 => Self::Inval,
            34 => Self::Range,
            38 => Self::NoSys,
            95 => Self::NotSup,
            110 => Self::TimedOut,
            other => Self::Other(other),
        }
    }
}

impl From<io::ErrorKind> for Errno {
    fn from(kind: io::ErrorKind) -> Self {
        use io::ErrorKind;
        match kind {
            ErrorKind::NotFound => Self::NoEnt,
            ErrorKind::PermissionDenied => Self::Access,
            ErrorKind::AlreadyExists => Self::Exist,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Self::Inval,
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::Unsupported => Self::NotSup,
            _ => Self::Io,
        }
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code > 0 => Self::from_code(code as u32),
            _ => Self::from(err.kind()),
        }
    }
}
