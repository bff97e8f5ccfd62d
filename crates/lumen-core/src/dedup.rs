//! Deduplication planning: collapse near-duplicate images into groups.
//!
//! Generated corpora are full of same-parameters variants (a base render
//! plus its upscale). Grouping by the canonical parameter fingerprint and
//! embedding only one representative per group turns an O(N) encoding
//! problem into O(N/k) for an average class size of k.
//!
//! The planner is pure compute over metadata; it never touches the encoder
//! pool or the store.

use std::collections::BTreeMap;

use crate::fingerprint::sha256;
use crate::types::{Fingerprint, GenerationParameters, ImageRecord, RepresentativeGroup};

/// Field separator inside the canonical parameter string.
const FIELD_SEP: char = '\x1F';

/// Format a decimal for the canonical string: fixed-point, invariant
/// locale, trailing zeros trimmed (`7.0` renders as `7`, `7.50` as `7.5`).
pub fn format_decimal(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    // Shortest round-trip formatting is fixed-point for f64 and already
    // omits trailing zeros, which makes it stable across platforms.
    format!("{value}")
}

/// The canonical, order-fixed string form of a parameter tuple.
pub fn canonical_string(params: &GenerationParameters) -> String {
    let mut s = String::with_capacity(
        params.prompt.len() + params.negative_prompt.len() + params.model_name.len() + 64,
    );
    s.push_str(&params.prompt);
    s.push(FIELD_SEP);
    s.push_str(&params.negative_prompt);
    s.push(FIELD_SEP);
    s.push_str(&params.model_name);
    s.push(FIELD_SEP);
    s.push_str(&params.seed.to_string());
    s.push(FIELD_SEP);
    s.push_str(&params.steps.to_string());
    s.push(FIELD_SEP);
    s.push_str(&format_decimal(params.cfg_scale));
    s.push(FIELD_SEP);
    s.push_str(&params.sampler);
    s.push(FIELD_SEP);
    s.push_str(&params.scheduler);
    s.push(FIELD_SEP);
    s.push_str(&params.width.to_string());
    s.push('x');
    s.push_str(&params.height.to_string());
    s
}

/// Digest of the canonical parameter string.
pub fn metadata_fingerprint(params: &GenerationParameters) -> Fingerprint {
    sha256(canonical_string(params).as_bytes())
}

/// Rank a record for representative selection.
///
/// Largest decoded pixel area wins, then largest file size, then lowest
/// id. This stably prefers an upscaled variant over its base render.
fn selection_key(record: &ImageRecord) -> (u64, u64, i64) {
    let area = record.width as u64 * record.height as u64;
    (area, record.file_size, -record.id)
}

/// Group records by metadata fingerprint and pick one representative each.
///
/// Deterministic: the same input set always yields the same groups and the
/// same representatives, regardless of input order. Every record lands in
/// exactly one group; singleton groups are common.
pub fn plan(records: &[ImageRecord]) -> Vec<RepresentativeGroup> {
    let mut by_fp: BTreeMap<Fingerprint, Vec<&ImageRecord>> = BTreeMap::new();
    for record in records {
        let fp = record
            .metadata_hash
            .unwrap_or_else(|| metadata_fingerprint(&record.params));
        by_fp.entry(fp).or_default().push(record);
    }

    by_fp
        .into_iter()
        .map(|(metadata_fp, members)| {
            let representative = members
                .iter()
                .max_by_key(|r| selection_key(r))
                .expect("group has at least one member");
            RepresentativeGroup {
                metadata_fp,
                representative_image_id: representative.id,
                member_image_ids: members.iter().map(|r| r.id).collect(),
            }
        })
        .collect()
}
