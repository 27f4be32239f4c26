//! DANE TLSA data model and certificate verification per RFC 6698 and
//! RFC 7672, for use at `_<port>._tcp.<mx-host>` service endpoints.

use hickory_proto::rr::rdata::tlsa;
use std::fmt;
use thiserror::Error;

mod verify;
pub use verify::{DaneMatch, DaneVerifier, VerifyLog};

/// Build the DNS owner name for the TLSA records of a service endpoint,
/// per <https://datatracker.ietf.org/doc/html/rfc6698#section-3>.
pub fn tlsa_fqdn(hostname: &str, port: u16) -> String {
    format!("_{port}._tcp.{}", hostname.trim_end_matches('.'))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertUsage {
    PkixTa = 0,
    PkixEe = 1,
    DaneTa = 2,
    DaneEe = 3,
}

impl CertUsage {
    /// RFC 7218 acronym for this usage
    pub fn label(&self) -> &'static str {
        match self {
            Self::PkixTa => "PKIX-TA",
            Self::PkixEe => "PKIX-EE",
            Self::DaneTa => "DANE-TA",
            Self::DaneEe => "DANE-EE",
        }
    }

    /// Trust-anchor usages constrain a certificate somewhere in the
    /// chain rather than the end-entity certificate itself.
    pub fn is_trust_anchor(&self) -> bool {
        matches!(self, Self::PkixTa | Self::DaneTa)
    }
}

impl TryFrom<u8> for CertUsage {
    type Error = DaneError;

    fn try_from(value: u8) -> Result<Self, DaneError> {
        match value {
            0 => Ok(Self::PkixTa),
            1 => Ok(Self::PkixEe),
            2 => Ok(Self::DaneTa),
            3 => Ok(Self::DaneEe),
            n => Err(DaneError::error(format!("unsupported TLSA usage {n}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    /// The full DER encoding of the certificate
    Full = 0,
    /// The DER encoding of the SubjectPublicKeyInfo
    Spki = 1,
}

impl TryFrom<u8> for Selector {
    type Error = DaneError;

    fn try_from(value: u8) -> Result<Self, DaneError> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::Spki),
            n => Err(DaneError::error(format!("unsupported TLSA selector {n}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Matching {
    /// Compare the selector data as-is
    Full = 0,
    Sha256 = 1,
    Sha512 = 2,
}

impl TryFrom<u8> for Matching {
    type Error = DaneError;

    fn try_from(value: u8) -> Result<Self, DaneError> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::Sha256),
            2 => Ok(Self::Sha512),
            n => Err(DaneError::error(format!(
                "unsupported TLSA matching type {n}"
            ))),
        }
    }
}

/// Certificate association data as supplied by the caller: either raw
/// bytes (the wire form) or a hex string (the presentation form).
/// Normalization to bytes happens inside the verifier so that a
/// malformed record degrades to a per-record diagnostic instead of
/// failing the whole host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertAssociation {
    Bytes(Vec<u8>),
    Hex(String),
}

impl CertAssociation {
    pub fn normalize(&self) -> Result<Vec<u8>, DaneError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Hex(s) => hex::decode(s.trim()).map_err(|err| {
                DaneError::error(format!("invalid hex certificate association data: {err}"))
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsaRecord {
    pub usage: CertUsage,
    pub selector: Selector,
    pub matching: Matching,
    pub association: CertAssociation,
}

impl TlsaRecord {
    pub fn new(
        usage: CertUsage,
        selector: Selector,
        matching: Matching,
        association: CertAssociation,
    ) -> Self {
        Self {
            usage,
            selector,
            matching,
            association,
        }
    }
}

impl fmt::Display for TlsaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ",
            self.usage as u8, self.selector as u8, self.matching as u8
        )?;
        match &self.association {
            CertAssociation::Bytes(bytes) => f.write_str(&hex::encode(bytes)),
            CertAssociation::Hex(s) => f.write_str(s),
        }
    }
}

impl TryFrom<&tlsa::TLSA> for TlsaRecord {
    type Error = DaneError;

    fn try_from(record: &tlsa::TLSA) -> Result<Self, DaneError> {
        let usage = match record.cert_usage() {
            tlsa::CertUsage::PkixTa => CertUsage::PkixTa,
            tlsa::CertUsage::PkixEe => CertUsage::PkixEe,
            tlsa::CertUsage::DaneTa => CertUsage::DaneTa,
            tlsa::CertUsage::DaneEe => CertUsage::DaneEe,
            other => {
                return Err(DaneError::error(format!(
                    "unsupported TLSA usage {other:?}"
                )))
            }
        };
        let selector = match record.selector() {
            tlsa::Selector::Full => Selector::Full,
            tlsa::Selector::Spki => Selector::Spki,
            other => {
                return Err(DaneError::error(format!(
                    "unsupported TLSA selector {other:?}"
                )))
            }
        };
        let matching = match record.matching() {
            tlsa::Matching::Raw => Matching::Full,
            tlsa::Matching::Sha256 => Matching::Sha256,
            tlsa::Matching::Sha512 => Matching::Sha512,
            other => {
                return Err(DaneError::error(format!(
                    "unsupported TLSA matching type {other:?}"
                )))
            }
        };
        Ok(Self {
            usage,
            selector,
            matching,
            association: CertAssociation::Bytes(record.cert_data().to_vec()),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaneErrorCode {
    /// Records were evaluated and none matched the presented certificate
    VerificationFailed,
    /// No record could be evaluated at all
    VerificationError,
}

impl DaneErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationFailed => "DANE_VERIFICATION_FAILED",
            Self::VerificationError => "DANE_VERIFICATION_ERROR",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct DaneError {
    pub code: DaneErrorCode,
    pub message: String,
}

impl DaneError {
    pub fn failed(message: String) -> Self {
        Self {
            code: DaneErrorCode::VerificationFailed,
            message,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            code: DaneErrorCode::VerificationError,
            message,
        }
    }
}
