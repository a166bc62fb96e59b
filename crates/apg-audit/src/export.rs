// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit export bundles: tar.gz with canonical records, proof, and key.

use crate::{AuditError, ChainReport, merkle_root};
use apg_core::InteractionRecord;
use apg_keys::KeyManager;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::Write;

/// The proof document shipped alongside exported records.
#[derive(Debug, Serialize)]
struct VerificationProof {
    chain_valid: bool,
    signature_valid_count: usize,
    record_count: usize,
    merkle_root: String,
    public_key_b64: String,
}

/// A finished tar.gz export.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    /// Gzipped tar bytes.
    pub bytes: Vec<u8>,
}

impl ExportBundle {
    /// Member names inside the archive, in order. Used by verification
    /// tooling and tests.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Export`] when the archive cannot be read back.
    pub fn member_names(&self) -> Result<Vec<String>, AuditError> {
        let mut archive = tar::Archive::new(GzDecoder::new(self.bytes.as_slice()));
        let mut names = Vec::new();
        for entry in archive
            .entries()
            .map_err(|e| AuditError::Export(e.to_string()))?
        {
            let entry = entry.map_err(|e| AuditError::Export(e.to_string()))?;
            names.push(
                entry
                    .path()
                    .map_err(|e| AuditError::Export(e.to_string()))?
                    .display()
                    .to_string(),
            );
        }
        Ok(names)
    }
}

/// Assemble the bundle for the given records and per-chain reports.
pub(crate) fn build_bundle(
    keys: &KeyManager,
    records: &[InteractionRecord],
    reports: &[ChainReport],
) -> Result<ExportBundle, AuditError> {
    let mut jsonl = String::new();
    for record in records {
        let value = serde_json::to_value(record).unwrap_or_default();
        jsonl.push_str(&apg_canon::canonicalize(&value)?);
        jsonl.push('\n');
    }

    let proof = VerificationProof {
        chain_valid: reports.iter().all(|r| r.valid),
        signature_valid_count: reports.iter().map(|r| r.signature_valid_count).sum(),
        record_count: records.len(),
        merkle_root: merkle_root(
            &records
                .iter()
                .map(|r| r.record_hash.clone())
                .collect::<Vec<_>>(),
        ),
        public_key_b64: keys.public_key_b64(),
    };
    let proof_json =
        serde_json::to_vec_pretty(&proof).map_err(|e| AuditError::Export(e.to_string()))?;

    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(gz);
    append_member(&mut tar, "records.jsonl", jsonl.as_bytes())?;
    append_member(&mut tar, "verification_proof.json", &proof_json)?;
    append_member(&mut tar, "public_key.pem", keys.public_key_pem().as_bytes())?;

    let gz = tar
        .into_inner()
        .map_err(|e| AuditError::Export(e.to_string()))?;
    let bytes = gz.finish().map_err(|e| AuditError::Export(e.to_string()))?;
    Ok(ExportBundle { bytes })
}

fn append_member<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), AuditError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, data)
        .map_err(|e| AuditError::Export(e.to_string()))
}
