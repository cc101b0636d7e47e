//! Entity identity confidence
//!
//! Confidence that an entity really is one subject rises when independent
//! modalities corroborate it and erodes over long single-modality runs.
//! Independently of matches, confidence goes stale the longer an entity
//! goes unseen:
//!
//! `confidence(now) = score * 0.5^(age / half_life)`

use chrono::{DateTime, Duration, Utc};

use crate::config::EntityConfig;
use crate::types::{MobileEntity, Modality};

/// Confidence at which a decayed score is no longer considered meaningful
pub const MEANINGFUL_CONFIDENCE: f64 = 0.1;

/// Confidence update rules for mobile entities
#[derive(Debug, Clone)]
pub struct ConfidenceModel {
    config: EntityConfig,
}

impl ConfidenceModel {
    pub fn new(config: EntityConfig) -> Self {
        Self { config }
    }

    /// Starting confidence of an entity created from one piece of evidence.
    ///
    /// GPS devices are one subject by construction; CDR subscribers usually
    /// are; probe hashes are frequently randomized.
    pub fn initial(&self, modality: Modality) -> f64 {
        let base: f64 = match modality {
            Modality::Gps => 0.5,
            Modality::Cdr => 0.4,
            Modality::Probe => 0.3,
        };
        base.max(self.config.confidence_floor)
    }

    /// Apply one accepted match to the entity's score.
    ///
    /// `active_modalities` must already reflect the new evidence.
    pub fn on_match(&self, entity: &mut MobileEntity) {
        if entity.active_modalities.len() >= 2 {
            let headroom = 1.0 - entity.confidence_score;
            entity.confidence_score += headroom * self.config.corroboration_gain;
            entity.single_modality_run = 0;
        } else {
            entity.single_modality_run = entity.single_modality_run.saturating_add(1);
            entity.confidence_score = (entity.confidence_score * self.config.single_modality_decay)
                .max(self.config.confidence_floor);
        }
        entity.confidence_score = entity.confidence_score.clamp(0.0, 1.0);
    }

    /// Score after staleness decay at `now`
    pub fn at(&self, score: f64, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - last_seen).num_milliseconds().max(0) as f64 / 1000.0;
        let decay = 0.5_f64.powf(age_secs / self.config.confidence_half_life_secs);
        (score * decay).clamp(0.0, 1.0)
    }

    /// Entity confidence at `now`
    pub fn entity_at(&self, entity: &MobileEntity, now: DateTime<Utc>) -> f64 {
        self.at(entity.confidence_score, entity.last_seen, now)
    }

    /// Time at which `score` decays below [`MEANINGFUL_CONFIDENCE`]
    pub fn valid_until(&self, score: f64, last_seen: DateTime<Utc>) -> DateTime<Utc> {
        if score <= MEANINGFUL_CONFIDENCE {
            return last_seen;
        }
        // score * 0.5^(t/h) = m  =>  t = h * log2(score / m)
        let secs = self.config.confidence_half_life_secs * (score / MEANINGFUL_CONFIDENCE).log2();
        last_seen + Duration::milliseconds((secs * 1000.0) as i64)
    }
}

impl Default for ConfidenceModel {
    fn default() -> Self {
        Self::new(EntityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, Location};
    use chrono::TimeZone;
    use std::collections::{BTreeMap, BTreeSet};

    fn entity(modalities: &[Modality], score: f64) -> MobileEntity {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        MobileEntity {
            entity_id: EntityId::new(),
            last_known_location: Location::new(40.0, -73.0, 10.0),
            last_seen: t0,
            active_modalities: modalities.iter().copied().collect::<BTreeSet<_>>(),
            confidence_score: score,
            created_at: t0,
            modality_last_seen: BTreeMap::new(),
            sources: BTreeMap::new(),
            single_modality_run: 0,
            evidence_count: 1,
        }
    }

    #[test]
    fn test_initial_confidence_by_modality() {
        let model = ConfidenceModel::default();
        assert_eq!(model.initial(Modality::Gps), 0.5);
        assert_eq!(model.initial(Modality::Cdr), 0.4);
        assert_eq!(model.initial(Modality::Probe), 0.3);

        let floored = ConfidenceModel::new(EntityConfig {
            confidence_floor: 0.45,
            ..Default::default()
        });
        assert_eq!(floored.initial(Modality::Gps), 0.5);
        assert_eq!(floored.initial(Modality::Probe), 0.45);
    }

    #[test]
    fn test_corroboration_raises_confidence() {
        let model = ConfidenceModel::default();
        let mut e = entity(&[Modality::Gps, Modality::Cdr], 0.5);
        model.on_match(&mut e);
        assert!((e.confidence_score - 0.625).abs() < 1e-12);
        assert_eq!(e.single_modality_run, 0);
    }

    #[test]
    fn test_single_modality_run_decays_to_floor() {
        let model = ConfidenceModel::default();
        let mut e = entity(&[Modality::Probe], 0.3);
        for _ in 0..500 {
            model.on_match(&mut e);
        }
        assert_eq!(e.single_modality_run, 500);
        assert_eq!(e.confidence_score, EntityConfig::default().confidence_floor);
    }

    #[test]
    fn test_staleness_half_life() {
        let model = ConfidenceModel::default();
        let seen = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        let later = seen + Duration::seconds(600);

        assert_eq!(model.at(0.8, seen, seen), 0.8);
        assert!((model.at(0.8, seen, later) - 0.4).abs() < 1e-12);
        // Evidence newer than `now` is not boosted
        assert_eq!(model.at(0.8, later, seen), 0.8);
    }

    #[test]
    fn test_valid_until() {
        let model = ConfidenceModel::default();
        let seen = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        // 0.8 -> 0.1 takes three half-lives
        assert_eq!(model.valid_until(0.8, seen), seen + Duration::seconds(1_800));
        assert_eq!(model.valid_until(0.05, seen), seen);
    }
}
