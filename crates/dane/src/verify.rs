use crate::{CertAssociation, CertUsage, DaneError, Matching, Selector, TlsaRecord};
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Structured log sink for verification outcomes: `(message, success)`.
pub type VerifyLog = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// The usage that satisfied verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaneMatch {
    pub usage: CertUsage,
}

/// Checks a presented certificate (and optionally its chain) against a
/// set of TLSA records. Built once per MX host after TLSA resolution
/// and consumed by whatever drives the TLS handshake.
///
/// With `enforce` unset the verifier only reports; it never fails.
pub struct DaneVerifier {
    records: Vec<TlsaRecord>,
    enforce: bool,
    log: Option<VerifyLog>,
}

impl std::fmt::Debug for DaneVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaneVerifier")
            .field("records", &self.records)
            .field("enforce", &self.enforce)
            .field("log", &self.log.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl DaneVerifier {
    pub fn new(records: Vec<TlsaRecord>) -> Self {
        Self {
            records,
            enforce: true,
            log: None,
        }
    }

    pub fn with_enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    pub fn with_log(mut self, log: VerifyLog) -> Self {
        self.log.replace(log);
        self
    }

    pub fn records(&self) -> &[TlsaRecord] {
        &self.records
    }

    fn emit(&self, message: &str, success: bool) {
        if success {
            tracing::debug!("{message}");
        } else {
            tracing::warn!("{message}");
        }
        if let Some(log) = &self.log {
            log(message, success);
        }
    }

    /// Verify `end_entity` (and `chain`, when the usage requires one)
    /// for `hostname`. `Ok(None)` means there was nothing to enforce:
    /// either no TLSA records exist, or enforcement is disabled.
    pub fn verify(
        &self,
        hostname: &str,
        end_entity: &CertificateDer<'_>,
        chain: Option<&[CertificateDer<'_>]>,
    ) -> Result<Option<DaneMatch>, DaneError> {
        if self.records.is_empty() {
            return Ok(None);
        }

        let mut diagnostics = vec![];
        let mut evaluated_any = false;

        for record in &self.records {
            let expected = match record.association.normalize() {
                Ok(bytes) => bytes,
                Err(err) => {
                    diagnostics.push(format!("record [{record}]: {}", err.message));
                    continue;
                }
            };

            if record.usage.is_trust_anchor() {
                let Some(chain) = chain else {
                    diagnostics.push(format!(
                        "TLSA usage {} requires certificate chain which is not available",
                        record.usage as u8
                    ));
                    continue;
                };
                let mut chain_evaluated = false;
                for cert in chain {
                    match Self::compare(record, cert, &expected) {
                        Ok(true) => {
                            let message = format!(
                                "{hostname}: certificate matched TLSA record [{record}] ({})",
                                record.usage.label()
                            );
                            self.emit(&message, true);
                            return Ok(Some(DaneMatch {
                                usage: record.usage,
                            }));
                        }
                        Ok(false) => {
                            chain_evaluated = true;
                            evaluated_any = true;
                        }
                        Err(err) => {
                            diagnostics.push(format!("record [{record}]: {}", err.message));
                        }
                    }
                }
                if chain_evaluated {
                    diagnostics.push(format!(
                        "no certificate in chain matched TLSA record [{record}]"
                    ));
                }
            } else {
                match Self::compare(record, end_entity, &expected) {
                    Ok(true) => {
                        let message = format!(
                            "{hostname}: certificate matched TLSA record [{record}] ({})",
                            record.usage.label()
                        );
                        self.emit(&message, true);
                        return Ok(Some(DaneMatch {
                            usage: record.usage,
                        }));
                    }
                    Ok(false) => {
                        evaluated_any = true;
                        diagnostics.push(format!(
                            "certificate does not match TLSA record [{record}]"
                        ));
                    }
                    Err(err) => {
                        diagnostics.push(format!("record [{record}]: {}", err.message));
                    }
                }
            }
        }

        let detail = diagnostics.join("; ");
        let message = format!("{hostname}: DANE verification failed: {detail}");
        self.emit(&message, false);

        if !self.enforce {
            return Ok(None);
        }

        Err(if evaluated_any {
            DaneError::failed(message)
        } else {
            DaneError::error(message)
        })
    }

    fn compare(
        record: &TlsaRecord,
        cert: &CertificateDer<'_>,
        expected: &[u8],
    ) -> Result<bool, DaneError> {
        let material = selector_data(cert, record.selector)?;
        Ok(matching_transform(&material, record.matching) == expected)
    }
}

/// Extract the part of the certificate the TLSA selector refers to.
fn selector_data(cert: &CertificateDer<'_>, selector: Selector) -> Result<Vec<u8>, DaneError> {
    match selector {
        Selector::Full => Ok(cert.as_ref().to_vec()),
        Selector::Spki => {
            let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|err| {
                DaneError::error(format!(
                    "failed to extract SubjectPublicKeyInfo from certificate: {err}"
                ))
            })?;
            Ok(parsed.public_key().raw.to_vec())
        }
    }
}

/// Pure by construction: `Full` is the identity, the hashes depend only
/// on their input.
fn matching_transform(data: &[u8], matching: Matching) -> Vec<u8> {
    match matching {
        Matching::Full => data.to_vec(),
        Matching::Sha256 => Sha256::digest(data).to_vec(),
        Matching::Sha512 => Sha512::digest(data).to_vec(),
    }
}
