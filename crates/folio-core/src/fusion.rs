//! Weighted fusion of book and character personality profiles.
//!
//! # Rules
//!
//! - Weights that are non-finite or below [`MIN_FUSION_WEIGHT`] are raised to
//!   it, then all weights are normalized to sum to 1.
//! - One profile fuses to itself, unchanged.
//! - For several profiles, each category (tone, values, speech patterns)
//!   scores a label as `Σ weightᵢ × descriptor_weight`, keeps the union
//!   sorted by score descending (ties: first occurrence in selection order),
//!   and caps it at [`MAX_FUSED_DESCRIPTORS`]. The first element is the
//!   category's resolved descriptor.
//! - Writing style and voice come from the highest-weighted profile that has
//!   one, earlier selection winning ties.
//! - Confidence is the weighted mean; source chunk ids are the ordered union.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{Descriptor, PersonalityProfile, ProfileAttributes, ProfileTarget};

/// Lowest effective weight an included entity can have.
pub const MIN_FUSION_WEIGHT: f64 = 0.05;

/// Session weight gained from a book's share of prior retrieval hits.
pub const RELEVANCE_GAIN: f64 = 0.5;

/// Session weight gained by the most recently selected entity.
pub const RECENCY_BONUS: f64 = 0.25;

pub const MAX_FUSED_DESCRIPTORS: usize = 10;

/// Per-turn blend of the selected profiles. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedProfile {
    /// Each contributing target with its normalized weight, in input order.
    pub members: Vec<(ProfileTarget, f64)>,
    pub attributes: ProfileAttributes,
    pub confidence: f64,
    pub source_chunk_ids: Vec<String>,
}

impl FusedProfile {
    /// Effective weight of a target, if it contributed.
    pub fn weight_of(&self, target: &ProfileTarget) -> Option<f64> {
        self.members
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, w)| *w)
    }
}

/// Fuse weighted profiles into one.
///
/// # Errors
///
/// [`Error::EmptyFusionInput`] when `profiles` is empty.
pub fn fuse(profiles: &[(PersonalityProfile, f64)]) -> Result<FusedProfile> {
    if profiles.is_empty() {
        return Err(Error::EmptyFusionInput);
    }

    let weights = normalize_weights(profiles.iter().map(|(_, w)| *w));
    let members = profiles
        .iter()
        .zip(&weights)
        .map(|((p, _), w)| (p.target.clone(), *w))
        .collect();

    if let [(only, _)] = profiles {
        return Ok(FusedProfile {
            members,
            attributes: only.attributes.clone(),
            confidence: only.confidence,
            source_chunk_ids: only.source_chunk_ids.clone(),
        });
    }

    let attributes = ProfileAttributes {
        tone: fuse_category(profiles, &weights, |a| &a.tone),
        values: fuse_category(profiles, &weights, |a| &a.values),
        speech_patterns: fuse_category(profiles, &weights, |a| &a.speech_patterns),
        writing_style: strongest_scalar(profiles, &weights, |a| a.writing_style.as_ref()),
        voice: strongest_scalar(profiles, &weights, |a| a.voice.as_ref()),
    };

    let confidence = profiles
        .iter()
        .zip(&weights)
        .map(|((p, _), w)| p.confidence * w)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    let mut seen = HashSet::new();
    let source_chunk_ids = profiles
        .iter()
        .flat_map(|(p, _)| p.source_chunk_ids.iter())
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    Ok(FusedProfile {
        members,
        attributes,
        confidence,
        source_chunk_ids,
    })
}

/// Floor each weight at [`MIN_FUSION_WEIGHT`] and normalize to sum to 1.
pub fn normalize_weights(raw: impl Iterator<Item = f64>) -> Vec<f64> {
    let floored: Vec<f64> = raw
        .map(|w| {
            if w.is_finite() && w >= MIN_FUSION_WEIGHT {
                w
            } else {
                MIN_FUSION_WEIGHT
            }
        })
        .collect();
    let total: f64 = floored.iter().sum();
    floored.into_iter().map(|w| w / total).collect()
}

fn fuse_category<F>(profiles: &[(PersonalityProfile, f64)], weights: &[f64], pick: F) -> Vec<Descriptor>
where
    F: Fn(&ProfileAttributes) -> &Vec<Descriptor>,
{
    // label -> (score, first occurrence)
    let mut scores: HashMap<&str, (f64, usize)> = HashMap::new();
    let mut order = 0usize;
    for ((profile, _), weight) in profiles.iter().zip(weights) {
        for d in pick(&profile.attributes) {
            let entry = scores.entry(d.label.as_str()).or_insert_with(|| {
                order += 1;
                (0.0, order)
            });
            entry.0 += weight * d.weight;
        }
    }

    let mut ranked: Vec<(&str, f64, usize)> =
        scores.into_iter().map(|(l, (s, o))| (l, s, o)).collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
    });
    ranked.truncate(MAX_FUSED_DESCRIPTORS);
    ranked
        .into_iter()
        .map(|(label, score, _)| Descriptor::new(label, score))
        .collect()
}

fn strongest_scalar<'a, F>(
    profiles: &'a [(PersonalityProfile, f64)],
    weights: &[f64],
    pick: F,
) -> Option<String>
where
    F: Fn(&'a ProfileAttributes) -> Option<&'a String>,
{
    let mut best: Option<(&String, f64)> = None;
    for ((profile, _), &weight) in profiles.iter().zip(weights) {
        if let Some(value) = pick(&profile.attributes) {
            if best.map_or(true, |(_, w)| weight > w) {
                best = Some((value, weight));
            }
        }
    }
    best.map(|(v, _)| v.clone())
}

/// Session weights for the selected targets, in selection order.
///
/// Each target starts at 1.0, gains `RELEVANCE_GAIN × hits/total_hits` from
/// its book's share of the session's prior evidence, and the last target
/// gains `RECENCY_BONUS`. Results are floored at [`MIN_FUSION_WEIGHT`].
pub fn session_weights(targets: &[ProfileTarget], hit_counts: &HashMap<String, usize>) -> Vec<f64> {
    let total: usize = targets
        .iter()
        .map(|t| t.book_id())
        .collect::<HashSet<_>>()
        .into_iter()
        .map(|b| hit_counts.get(b).copied().unwrap_or(0))
        .sum();
    let last = targets.len().saturating_sub(1);

    targets
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut w = 1.0;
            if total > 0 {
                let hits = hit_counts.get(t.book_id()).copied().unwrap_or(0);
                w += RELEVANCE_GAIN * hits as f64 / total as f64;
            }
            if i == last {
                w += RECENCY_BONUS;
            }
            w.max(MIN_FUSION_WEIGHT)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(book: &str, tone: &[(&str, f64)], confidence: f64) -> PersonalityProfile {
        PersonalityProfile {
            target: ProfileTarget::book(book),
            attributes: ProfileAttributes {
                tone: tone.iter().map(|(l, w)| Descriptor::new(*l, *w)).collect(),
                values: vec![],
                speech_patterns: vec![],
                writing_style: Some(format!("{} style", book)),
                voice: None,
            },
            confidence,
            source_chunk_ids: vec![format!("{}-c0", book), "shared".into()],
        }
    }

    #[test]
    fn test_empty_input_fails() {
        assert_eq!(fuse(&[]).unwrap_err(), Error::EmptyFusionInput);
    }

    #[test]
    fn test_single_profile_is_identity() {
        let p = profile("a", &[("grim", 1.0), ("wry", 0.85)], 0.7);
        for w in [1.0, 0.001, 42.0, -3.0, f64::NAN] {
            let fused = fuse(&[(p.clone(), w)]).unwrap();
            assert_eq!(fused.attributes, p.attributes);
            assert_eq!(fused.confidence, p.confidence);
            assert_eq!(fused.source_chunk_ids, p.source_chunk_ids);
            assert_eq!(fused.members, vec![(p.target.clone(), 1.0)]);
        }
    }

    #[test]
    fn test_weight_floor_keeps_every_entity() {
        let a = profile("a", &[("grim", 1.0)], 0.5);
        let b = profile("b", &[("light", 1.0)], 0.5);
        let fused = fuse(&[(a.clone(), 0.0), (b.clone(), -1.0)]).unwrap();
        for (_, w) in &fused.members {
            assert!(*w > 0.0);
        }
        let fused = fuse(&[(a.clone(), 100.0), (b.clone(), 0.0)]).unwrap();
        assert!(fused.weight_of(&b.target).unwrap() > 0.0);
        assert!(fused.attributes.tone.iter().any(|d| d.label == "light"));
    }

    #[test]
    fn test_equal_weights_union_with_tie_break() {
        let a = profile("a", &[("brooding", 1.0), ("grand", 0.85)], 0.6);
        let b = profile("b", &[("playful", 1.0), ("grand", 0.85)], 0.8);
        let fused = fuse(&[(a, 1.0), (b, 1.0)]).unwrap();
        let tone: Vec<_> = fused.attributes.tone.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(tone, vec!["grand", "brooding", "playful"]);
        assert!((fused.confidence - 0.7).abs() < 1e-9);
        assert_eq!(fused.attributes.writing_style.as_deref(), Some("a style"));
        assert_eq!(fused.source_chunk_ids, vec!["a-c0", "shared", "b-c0"]);
    }

    #[test]
    fn test_scalar_from_heaviest() {
        let a = profile("a", &[("x", 1.0)], 0.5);
        let b = profile("b", &[("y", 1.0)], 0.5);
        let fused = fuse(&[(a, 1.0), (b, 2.0)]).unwrap();
        assert_eq!(fused.attributes.writing_style.as_deref(), Some("b style"));
        assert_eq!(fused.attributes.tone[0].label, "y");
    }

    #[test]
    fn test_category_cap() {
        let labels: Vec<String> = (0..8).map(|i| format!("t{}", i)).collect();
        let a_tone: Vec<(&str, f64)> = labels.iter().map(|l| (l.as_str(), 0.5)).collect();
        let b_labels: Vec<String> = (0..8).map(|i| format!("u{}", i)).collect();
        let b_tone: Vec<(&str, f64)> = b_labels.iter().map(|l| (l.as_str(), 0.5)).collect();
        let fused = fuse(&[
            (profile("a", &a_tone, 0.5), 1.0),
            (profile("b", &b_tone, 0.5), 1.0),
        ])
        .unwrap();
        assert_eq!(fused.attributes.tone.len(), MAX_FUSED_DESCRIPTORS);
        assert_eq!(fused.attributes.tone[0].label, "t0");
    }

    #[test]
    fn test_session_weights() {
        let targets = vec![ProfileTarget::book("a"), ProfileTarget::book("b")];
        let none = session_weights(&targets, &HashMap::new());
        assert_eq!(none, vec![1.0, 1.25]);

        let mut hits = HashMap::new();
        hits.insert("a".to_string(), 3);
        hits.insert("b".to_string(), 1);
        let w = session_weights(&targets, &hits);
        assert!((w[0] - 1.375).abs() < 1e-9);
        assert!((w[1] - 1.375).abs() < 1e-9);
    }
}
