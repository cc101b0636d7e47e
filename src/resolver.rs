//! Entity resolution
//!
//! Maps each piece of positional evidence to a persistent mobile entity.
//! Candidates come from a grid index over last-known locations, gated by a
//! per-modality staleness bound, and are scored by spatial distance normalized
//! by the combined accuracy radii plus the temporal gap. The lowest score under
//! the acceptance threshold wins; ties go to the most recently seen entity.
//!
//! The resolver is the only place entity state is mutated. It is owned by one
//! shard and never shared, so updates for an entity are strictly ordered.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::confidence::ConfidenceModel;
use crate::config::{EntityConfig, FusionConfig, MatchingConfig, StalenessBounds};
use crate::error::FusionError;
use crate::geo::{haversine_m, normalize_lon, rings_for_radius, GridCell};
use crate::types::{EntityId, GeoPoint, Location, MobileEntity, Modality, PositionalEvidence};

/// Outcome of resolving one piece of evidence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub entity_id: EntityId,
    pub created: bool,
    /// Entity previously bound to this source that was evicted as dormant
    pub replaced: Option<EntityId>,
}

impl Resolution {
    /// The eviction race this resolution settled, if any
    pub fn eviction_race(&self) -> Option<FusionError> {
        self.replaced.map(|evicted| FusionError::EntityEvictionRace {
            evicted,
            replacement: self.entity_id,
        })
    }
}

#[derive(Debug, Clone)]
struct EvictedBinding {
    entity_id: EntityId,
    evicted_at: DateTime<Utc>,
}

/// Arena of active entities with a spatial index
#[derive(Debug)]
pub struct EntityResolver {
    matching: MatchingConfig,
    confidence: ConfidenceModel,
    inactivity_horizon: Duration,
    entities: HashMap<EntityId, MobileEntity>,
    index: HashMap<GridCell, Vec<EntityId>>,
    cells: HashMap<EntityId, GridCell>,
    evicted_sources: HashMap<(Modality, String), EvictedBinding>,
    /// Upper bound of any entity accuracy radius ever indexed
    max_accuracy_m: f64,
}

impl EntityResolver {
    pub fn new(matching: MatchingConfig, entities: EntityConfig) -> Self {
        Self {
            matching,
            inactivity_horizon: Duration::seconds(entities.inactivity_horizon_secs),
            confidence: ConfidenceModel::new(entities),
            entities: HashMap::new(),
            index: HashMap::new(),
            cells: HashMap::new(),
            evicted_sources: HashMap::new(),
            max_accuracy_m: 0.0,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.matching.clone(), config.entities.clone())
    }

    /// Assign evidence to the best matching entity, creating one if none qualifies
    pub fn resolve(&mut self, evidence: &PositionalEvidence) -> Resolution {
        let evicted = self
            .evicted_sources
            .remove(&(evidence.modality, evidence.source_id.clone()))
            .map(|binding| binding.entity_id);

        if let Some(entity_id) = self.best_candidate(evidence) {
            self.update(entity_id, evidence);
            return Resolution {
                entity_id,
                created: false,
                replaced: None,
            };
        }

        let entity_id = self.create(evidence);
        if let Some(evicted) = evicted {
            warn!(
                evicted = %evicted,
                replacement = %entity_id,
                modality = %evidence.modality,
                source_id = %evidence.source_id,
                "evidence arrived for an evicted entity; continuing as a fresh entity"
            );
        }
        Resolution {
            entity_id,
            created: true,
            replaced: evicted,
        }
    }

    /// Evict entities unseen for longer than the inactivity horizon at `now`
    pub fn evict_dormant(&mut self, now: DateTime<Utc>) -> Vec<MobileEntity> {
        let horizon = self.inactivity_horizon;
        let dormant: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| now - entity.last_seen > horizon)
            .map(|entity| entity.entity_id)
            .collect();

        let mut evicted = Vec::with_capacity(dormant.len());
        for entity_id in dormant {
            if let Some(entity) = self.remove(entity_id) {
                for (modality, source_id) in &entity.sources {
                    self.evicted_sources.insert(
                        (*modality, source_id.clone()),
                        EvictedBinding {
                            entity_id,
                            evicted_at: now,
                        },
                    );
                }
                evicted.push(entity);
            }
        }
        self.evicted_sources
            .retain(|_, binding| now - binding.evicted_at <= horizon);

        evicted.sort_by_key(|entity| entity.entity_id);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), active = self.entities.len(), "evicted dormant entities");
        }
        evicted
    }

    /// Entity that `evidence` would resolve to, without touching any state
    pub fn peek(&self, evidence: &PositionalEvidence) -> Option<EntityId> {
        self.best_candidate(evidence)
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&MobileEntity> {
        self.entities.get(entity_id)
    }

    pub fn active_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &MobileEntity> {
        self.entities.values()
    }

    pub fn confidence_model(&self) -> &ConfidenceModel {
        &self.confidence
    }

    /// Staleness-decayed confidence of an entity at `now`
    pub fn confidence_at(&self, entity_id: &EntityId, now: DateTime<Utc>) -> Option<f64> {
        self.entities
            .get(entity_id)
            .map(|entity| self.confidence.entity_at(entity, now))
    }

    fn best_candidate(&self, evidence: &PositionalEvidence) -> Option<EntityId> {
        let staleness = self.matching.staleness.for_modality(evidence.modality);
        let radius_m = self.search_radius_m(evidence, seconds(staleness));

        let mut best: Option<(f64, DateTime<Utc>, EntityId)> = None;
        for entity_id in self.candidates(evidence.location.point(), radius_m) {
            let Some(entity) = self.entities.get(&entity_id) else {
                continue;
            };
            let Some(score) = self.score(entity, evidence, staleness) else {
                continue;
            };
            if score > self.matching.acceptance_threshold {
                continue;
            }

            let better = match &best {
                None => true,
                Some((best_score, best_seen, best_id)) => match score.total_cmp(best_score) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => {
                        entity.last_seen > *best_seen
                            || (entity.last_seen == *best_seen && entity_id < *best_id)
                    }
                },
            };
            if better {
                best = Some((score, entity.last_seen, entity_id));
            }
        }
        best.map(|(_, _, entity_id)| entity_id)
    }

    /// Weighted match score, or `None` when the entity is not a candidate
    fn score(
        &self,
        entity: &MobileEntity,
        evidence: &PositionalEvidence,
        staleness: Duration,
    ) -> Option<f64> {
        let gap = (evidence.timestamp - entity.last_seen).abs();
        if gap > staleness {
            return None;
        }

        let bound_source = entity.sources.get(&evidence.modality);
        let same_source = bound_source.map(String::as_str) == Some(evidence.source_id.as_str());

        // One subject carries one active handset per exclusive modality.
        if evidence.modality.is_source_exclusive() && bound_source.is_some() && !same_source {
            let still_active = entity
                .modality_last_seen
                .get(&evidence.modality)
                .map_or(false, |seen| (evidence.timestamp - *seen).abs() <= staleness);
            if still_active {
                return None;
            }
        }

        let gap_secs = seconds(gap);
        let distance = haversine_m(evidence.location.point(), entity.last_known_location.point());
        let reach = evidence.location.accuracy_m
            + entity.last_known_location.accuracy_m
            + self.matching.max_speed_mps * gap_secs;

        let spatial = distance / reach;
        let temporal = gap_secs / seconds(staleness);
        let mut score = self.matching.spatial_weight * spatial + self.matching.temporal_weight * temporal;
        if same_source {
            score *= self.matching.same_source_affinity;
        }
        Some(score)
    }

    /// Distance beyond which no entity can score under the threshold
    fn search_radius_m(&self, evidence: &PositionalEvidence, staleness_secs: f64) -> f64 {
        let affinity = self.matching.same_source_affinity.min(1.0);
        let weight = self.matching.spatial_weight;
        if weight <= 0.0 || affinity <= 0.0 {
            return f64::INFINITY;
        }
        let reach = evidence.location.accuracy_m
            + self.max_accuracy_m
            + self.matching.max_speed_mps * staleness_secs;
        self.matching.acceptance_threshold * reach / (weight * affinity)
    }

    fn candidates(&self, point: GeoPoint, radius_m: f64) -> Vec<EntityId> {
        if !radius_m.is_finite() {
            return self.entities.keys().copied().collect();
        }

        let cell_deg = self.matching.grid_cell_deg;
        let center = GridCell::of(point, cell_deg);
        let rings = rings_for_radius(radius_m, point.lat, cell_deg);
        let side = 2.0 * rings as f64 + 1.0;

        if side * side > self.index.len() as f64 {
            // Fewer occupied cells than cells in range: walk the occupied ones.
            self.index
                .iter()
                .filter(|(cell, _)| cell.ring_distance(&center) <= rings)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        } else {
            center
                .neighborhood(rings)
                .filter_map(|cell| self.index.get(&cell))
                .flat_map(|ids| ids.iter().copied())
                .collect()
        }
    }

    fn create(&mut self, evidence: &PositionalEvidence) -> EntityId {
        let entity_id = EntityId::new();
        let entity = MobileEntity {
            entity_id,
            last_known_location: evidence.location,
            last_seen: evidence.timestamp,
            active_modalities: BTreeSet::from([evidence.modality]),
            confidence_score: self.confidence.initial(evidence.modality),
            created_at: evidence.timestamp,
            modality_last_seen: BTreeMap::from([(evidence.modality, evidence.timestamp)]),
            sources: BTreeMap::from([(evidence.modality, evidence.source_id.clone())]),
            single_modality_run: 0,
            evidence_count: 1,
        };

        self.max_accuracy_m = self.max_accuracy_m.max(evidence.location.accuracy_m);
        self.entities.insert(entity_id, entity);
        self.reindex(entity_id, evidence.location.point());

        debug!(
            entity_id = %entity_id,
            modality = %evidence.modality,
            source_id = %evidence.source_id,
            "created entity"
        );
        entity_id
    }

    fn update(&mut self, entity_id: EntityId, evidence: &PositionalEvidence) {
        let Some(entity) = self.entities.get_mut(&entity_id) else {
            return;
        };

        // Out-of-order evidence never moves the entity backwards in time.
        if evidence.timestamp >= entity.last_seen {
            let gap_secs = seconds(evidence.timestamp - entity.last_seen);
            let speed = evidence.speed_mps.unwrap_or(self.matching.max_speed_mps);
            let prior_radius = entity.last_known_location.accuracy_m + speed * gap_secs;
            entity.last_known_location =
                blend(&entity.last_known_location, prior_radius, &evidence.location);
            entity.last_seen = evidence.timestamp;
        }

        let seen = entity
            .modality_last_seen
            .entry(evidence.modality)
            .or_insert(evidence.timestamp);
        if evidence.timestamp >= *seen {
            *seen = evidence.timestamp;
            entity
                .sources
                .insert(evidence.modality, evidence.source_id.clone());
        }

        refresh_active(entity, &self.matching.staleness);
        entity.evidence_count += 1;
        self.confidence.on_match(entity);

        let location = entity.last_known_location;
        self.max_accuracy_m = self.max_accuracy_m.max(location.accuracy_m);
        self.reindex(entity_id, location.point());
    }

    fn remove(&mut self, entity_id: EntityId) -> Option<MobileEntity> {
        if let Some(cell) = self.cells.remove(&entity_id) {
            self.unindex(cell, entity_id);
        }
        self.entities.remove(&entity_id)
    }

    fn reindex(&mut self, entity_id: EntityId, point: GeoPoint) {
        let cell = GridCell::of(point, self.matching.grid_cell_deg);
        match self.cells.insert(entity_id, cell) {
            Some(previous) if previous == cell => return,
            Some(previous) => self.unindex(previous, entity_id),
            None => {}
        }
        self.index.entry(cell).or_default().push(entity_id);
    }

    fn unindex(&mut self, cell: GridCell, entity_id: EntityId) {
        if let Some(ids) = self.index.get_mut(&cell) {
            ids.retain(|id| *id != entity_id);
            if ids.is_empty() {
                self.index.remove(&cell);
            }
        }
    }
}

/// Inverse-variance blend of a prior location with a new observation
fn blend(prior: &Location, prior_radius_m: f64, observed: &Location) -> Location {
    let prior_weight = 1.0 / (prior_radius_m * prior_radius_m);
    let observed_weight = 1.0 / (observed.accuracy_m * observed.accuracy_m);
    let gain = observed_weight / (prior_weight + observed_weight);

    let lat = prior.lat + (observed.lat - prior.lat) * gain;
    let lon = normalize_lon(prior.lon + normalize_lon(observed.lon - prior.lon) * gain);
    Location::new(lat, lon, (1.0 / (prior_weight + observed_weight)).sqrt())
}

fn refresh_active(entity: &mut MobileEntity, staleness: &StalenessBounds) {
    let reference = entity.last_seen;
    entity.active_modalities = entity
        .modality_last_seen
        .iter()
        .filter(|(modality, seen)| reference - **seen <= staleness.for_modality(**modality))
        .map(|(modality, _)| *modality)
        .collect();
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn resolver() -> EntityResolver {
        EntityResolver::from_config(&FusionConfig::default())
    }

    fn evidence(
        modality: Modality,
        source: &str,
        secs: i64,
        lat: f64,
        lon: f64,
        accuracy_m: f64,
    ) -> PositionalEvidence {
        let timestamp = t0() + Duration::seconds(secs);
        PositionalEvidence {
            modality,
            source_id: source.to_string(),
            timestamp,
            location: Location::new(lat, lon, accuracy_m),
            signal_strength_dbm: None,
            speed_mps: None,
            raw_payload_ref: format!("{modality}:{source}:{secs}"),
        }
    }

    #[test]
    fn test_same_source_close_in_space_and_time_matches() {
        let mut resolver = resolver();
        let first = resolver.resolve(&evidence(Modality::Gps, "dev-1", 0, 40.0, -73.0, 5.0));
        // ~5 m north, 2 s later
        let second = resolver.resolve(&evidence(Modality::Gps, "dev-1", 2, 40.000045, -73.0, 5.0));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(resolver.active_count(), 1);
        assert_eq!(resolver.get(&first.entity_id).unwrap().evidence_count, 2);
    }

    #[test]
    fn test_far_apart_in_space_and_time_creates_distinct_entities() {
        let mut resolver = resolver();
        let first = resolver.resolve(&evidence(Modality::Gps, "dev-1", 0, 40.0, -73.0, 5.0));
        // ~50 km north, one hour later
        let second = resolver.resolve(&evidence(Modality::Gps, "dev-1", 3_600, 40.45, -73.0, 5.0));

        assert!(second.created);
        assert_ne!(first.entity_id, second.entity_id);
        assert_eq!(resolver.active_count(), 2);
    }

    #[test]
    fn test_distinct_active_gps_devices_never_merge() {
        let mut resolver = resolver();
        let a = resolver.resolve(&evidence(Modality::Gps, "dev-a", 0, 40.0, -73.0, 5.0));
        let b = resolver.resolve(&evidence(Modality::Gps, "dev-b", 1, 40.0, -73.0, 5.0));
        assert_ne!(a.entity_id, b.entity_id);
    }

    #[test]
    fn test_cdr_corroborates_gps_entity() {
        let mut resolver = resolver();
        let gps = resolver.resolve(&evidence(Modality::Gps, "dev-1", 0, 40.0, -73.0, 5.0));
        let before = resolver.get(&gps.entity_id).unwrap().confidence_score;

        let cdr = resolver.resolve(&evidence(Modality::Cdr, "sub-1", 1, 40.002, -73.001, 400.0));
        assert_eq!(cdr.entity_id, gps.entity_id);

        let entity = resolver.get(&gps.entity_id).unwrap();
        assert_eq!(
            entity.active_modalities,
            BTreeSet::from([Modality::Gps, Modality::Cdr])
        );
        assert!(entity.confidence_score > before);
        assert_eq!(entity.sources.get(&Modality::Cdr).map(String::as_str), Some("sub-1"));
        // The coarse CDR barely moves a precise fix
        assert!((entity.last_known_location.lat - 40.0).abs() < 0.0001);
    }

    #[test]
    fn test_out_of_order_evidence_does_not_rewind() {
        let mut resolver = resolver();
        let first = resolver.resolve(&evidence(Modality::Gps, "dev-1", 10, 40.0, -73.0, 5.0));
        let late = resolver.resolve(&evidence(Modality::Gps, "dev-1", 4, 40.0003, -73.0, 5.0));
        assert_eq!(first.entity_id, late.entity_id);

        let entity = resolver.get(&first.entity_id).unwrap();
        assert_eq!(entity.last_seen, t0() + Duration::seconds(10));
        assert_eq!(entity.last_known_location.lat, 40.0);
        assert_eq!(entity.evidence_count, 2);
    }

    #[test]
    fn test_ties_go_to_most_recently_seen() {
        let mut resolver = resolver();
        let older = resolver.resolve(&evidence(Modality::Gps, "dev-a", 0, 40.0, -73.0, 5.0));
        let newer = resolver.resolve(&evidence(Modality::Gps, "dev-b", 2, 40.0, -73.0, 5.0));
        assert_ne!(older.entity_id, newer.entity_id);

        // Equidistant in space and time from both entities
        let probe = resolver.resolve(&evidence(Modality::Probe, "ff01", 1, 40.0, -73.0, 30.0));
        assert_eq!(probe.entity_id, newer.entity_id);
    }

    #[test]
    fn test_evict_dormant_and_eviction_race() {
        let mut resolver = resolver();
        let first = resolver.resolve(&evidence(Modality::Gps, "dev-1", 0, 40.0, -73.0, 5.0));
        resolver.resolve(&evidence(Modality::Gps, "dev-2", 1_500, 41.0, -73.0, 5.0));

        let evicted = resolver.evict_dormant(t0() + Duration::seconds(1_801));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].entity_id, first.entity_id);
        assert_eq!(resolver.active_count(), 1);
        assert!(resolver.get(&first.entity_id).is_none());

        let returned = resolver.resolve(&evidence(Modality::Gps, "dev-1", 1_810, 40.0, -73.0, 5.0));
        assert!(returned.created);
        assert_eq!(returned.replaced, Some(first.entity_id));
        assert!(matches!(
            returned.eviction_race(),
            Some(FusionError::EntityEvictionRace { evicted, .. }) if evicted == first.entity_id
        ));

        // The race is reported once per eviction
        let again = resolver.resolve(&evidence(Modality::Gps, "dev-1", 1_811, 40.0, -73.0, 5.0));
        assert_eq!(again.entity_id, returned.entity_id);
        assert!(again.replaced.is_none());
    }

    #[test]
    fn test_index_lookup_with_many_occupied_cells() {
        let mut resolver = resolver();
        let mut ids = Vec::new();
        for row in 0..15 {
            for col in 0..15 {
                let lat = 40.0 + row as f64 * 0.05;
                let lon = -73.0 + col as f64 * 0.05;
                let source = format!("dev-{row}-{col}");
                ids.push(resolver.resolve(&evidence(Modality::Gps, &source, 0, lat, lon, 5.0)));
            }
        }
        assert!(ids.iter().all(|r| r.created));
        assert_eq!(resolver.active_count(), 225);

        let point = GeoPoint::new(40.35, -72.65);
        let radius = resolver.search_radius_m(
            &evidence(Modality::Gps, "dev-7-7", 3, 40.35, -72.65, 5.0),
            30.0,
        );
        let mut near: Vec<_> = resolver.candidates(point, radius);
        near.sort();
        assert!(!near.is_empty());
        assert!(near.len() < 225);
        assert!(near.contains(&ids[7 * 15 + 7].entity_id));

        let matched =
            resolver.resolve(&evidence(Modality::Gps, "dev-7-7", 3, 40.35002, -72.65, 5.0));
        assert_eq!(matched.entity_id, ids[7 * 15 + 7].entity_id);
    }

    #[test]
    fn test_confidence_at_decays() {
        let mut resolver = resolver();
        let r = resolver.resolve(&evidence(Modality::Gps, "dev-1", 0, 40.0, -73.0, 5.0));
        let fresh = resolver.confidence_at(&r.entity_id, t0()).unwrap();
        let stale = resolver
            .confidence_at(&r.entity_id, t0() + Duration::seconds(600))
            .unwrap();
        assert!((stale - fresh / 2.0).abs() < 1e-12);
    }
}
