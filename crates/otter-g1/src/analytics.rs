//! Pause cost model.
//!
//! Every young or mixed pause reports the time spent in its phases together
//! with the amount of work done (live objects, evacuated bytes, scanned cards).
//! The rates derived from these reports are kept as short rolling sequences and
//! combined by [`G1Predictor`] into conservative estimates:
//! `mean + confidence * stddev`.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

use crate::collection_set::CollectionSet;
use crate::region::Region;

/// Samples kept per sequence.
pub const SEQUENCE_LENGTH: usize = 10;

/// Rolling window of measurements.
#[derive(Debug, Clone)]
pub struct Sequence {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Sequence {
    /// Window of at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Record a sample, evicting the oldest one when full.
    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Arithmetic mean, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Population standard deviation, 0 when empty.
    pub fn stddev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .samples
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.samples.len() as f64;
        var.sqrt()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(SEQUENCE_LENGTH)
    }
}

/// Turns a sequence into a prediction.
#[derive(Debug, Clone, Copy)]
pub struct G1Predictor {
    confidence_factor: f64,
}

impl G1Predictor {
    /// Predictor weighting the standard deviation by `confidence_factor`.
    pub fn new(confidence_factor: f64) -> Self {
        Self { confidence_factor }
    }

    /// `mean + confidence * stddev`.
    pub fn predict(&self, seq: &Sequence) -> f64 {
        seq.mean() + self.confidence_factor * seq.stddev()
    }
}

#[derive(Default)]
struct Timer {
    start: Option<Instant>,
    micros: f64,
}

impl Timer {
    fn start(&mut self, now: Instant) {
        self.start = Some(now);
    }

    fn end(&mut self, now: Instant) {
        if let Some(start) = self.start.take() {
            self.micros += micros_between(start, now);
        }
    }

    fn take(&mut self) -> f64 {
        self.start = None;
        std::mem::take(&mut self.micros)
    }
}

#[derive(Default)]
struct AnalyticsState {
    collection_start: Option<Instant>,
    previous_collection_end: Option<Instant>,
    marking: Timer,
    evacuation: Timer,
    promotion: Timer,
    update_refs: Timer,
    scan_remset: Timer,
    evacuated_bytes: usize,
    live_objects: usize,
    promoted_regions: usize,
    scanned_cards: usize,

    allocation_rate: Sequence,
    marking_rate: Sequence,
    copy_rate: Sequence,
    promotion_cost: Sequence,
    remset_scan_rate: Sequence,
    update_refs_rate: Sequence,
    other_time: Sequence,
    live_objects_per_region: Sequence,
    evacuated_bytes_per_region: Sequence,
    promoted_regions_share: Sequence,
    prediction_error: Sequence,
}

fn micros_between(start: Instant, end: Instant) -> f64 {
    end.saturating_duration_since(start).as_secs_f64() * 1_000_000.0
}

/// Measurements and predictions of pause costs.
pub struct G1Analytics {
    predictor: G1Predictor,
    state: Mutex<AnalyticsState>,
}

impl G1Analytics {
    /// Empty model; the allocation rate is measured from `now`.
    pub fn new(confidence_factor: f64, now: Instant) -> Self {
        let state = AnalyticsState {
            previous_collection_end: Some(now),
            ..AnalyticsState::default()
        };
        Self {
            predictor: G1Predictor::new(confidence_factor),
            state: Mutex::new(state),
        }
    }

    /// A pause begins; `eden_regions` were filled since the previous one.
    pub fn report_collection_start(&self, now: Instant, eden_regions: usize) {
        let mut state = self.state.lock();
        if let Some(prev) = state.previous_collection_end {
            let elapsed = micros_between(prev, now);
            if elapsed > 0.0 {
                state.allocation_rate.add(eden_regions as f64 / elapsed);
            }
        }
        state.collection_start = Some(now);
        state.evacuated_bytes = 0;
        state.live_objects = 0;
        state.promoted_regions = 0;
        state.scanned_cards = 0;
        state.marking.take();
        state.evacuation.take();
        state.promotion.take();
        state.update_refs.take();
        state.scan_remset.take();
    }

    /// Collection-set marking begins.
    pub fn report_marking_start(&self, now: Instant) {
        self.state.lock().marking.start(now);
    }

    /// Collection-set marking ends.
    pub fn report_marking_end(&self, now: Instant) {
        self.state.lock().marking.end(now);
    }

    /// Evacuation begins.
    pub fn report_evacuation_start(&self, now: Instant) {
        self.state.lock().evacuation.start(now);
    }

    /// Evacuation ends.
    pub fn report_evacuation_end(&self, now: Instant) {
        self.state.lock().evacuation.end(now);
    }

    /// In-place promotion of young regions begins.
    pub fn report_promotion_start(&self, now: Instant) {
        self.state.lock().promotion.start(now);
    }

    /// In-place promotion of young regions ends.
    pub fn report_promotion_end(&self, now: Instant) {
        self.state.lock().promotion.end(now);
    }

    /// Reference update begins.
    pub fn report_update_refs_start(&self, now: Instant) {
        self.state.lock().update_refs.start(now);
    }

    /// Reference update ends.
    pub fn report_update_refs_end(&self, now: Instant) {
        self.state.lock().update_refs.end(now);
    }

    /// Remembered-set scan begins.
    pub fn report_scan_remset_start(&self, now: Instant) {
        self.state.lock().scan_remset.start(now);
    }

    /// Remembered-set scan ends after `cards` cards.
    pub fn report_scan_remset_end(&self, now: Instant, cards: usize) {
        let mut state = self.state.lock();
        state.scan_remset.end(now);
        state.scanned_cards += cards;
    }

    /// Bytes copied by evacuation.
    pub fn report_evacuated_bytes(&self, bytes: usize) {
        self.state.lock().evacuated_bytes += bytes;
    }

    /// Objects found live in the collection set.
    pub fn report_live_objects(&self, count: usize) {
        self.state.lock().live_objects += count;
    }

    /// A young region was promoted in place.
    pub fn report_promoted_region(&self) {
        self.state.lock().promoted_regions += 1;
    }

    /// The pause ends; fold its measurements into the sequences.
    pub fn report_collection_end(&self, now: Instant, collection_set: &CollectionSet) {
        let young = collection_set.young().len();
        let predicted = self.predict_collection_time(collection_set);
        let mut state = self.state.lock();
        let Some(start) = state.collection_start.take() else {
            return;
        };
        let total = micros_between(start, now);
        let marking = state.marking.take();
        let evacuation = state.evacuation.take();
        let promotion = state.promotion.take();
        let update_refs = state.update_refs.take();
        let scan_remset = state.scan_remset.take();

        if let Some(predicted) = predicted {
            state.prediction_error.add((total - predicted).abs());
        }
        if state.live_objects > 0 {
            let live = state.live_objects as f64;
            state.marking_rate.add(marking / live);
            state.update_refs_rate.add(update_refs / live);
        }
        if state.evacuated_bytes > 0 {
            let rate = evacuation / state.evacuated_bytes as f64;
            state.copy_rate.add(rate);
        }
        if state.promoted_regions > 0 {
            let cost = promotion / state.promoted_regions as f64;
            state.promotion_cost.add(cost);
        }
        if state.scanned_cards > 0 {
            let rate = scan_remset / state.scanned_cards as f64;
            state.remset_scan_rate.add(rate);
        }
        let other =
            (total - marking - evacuation - promotion - update_refs - scan_remset).max(0.0);
        state.other_time.add(other);
        if young > 0 {
            let live = state.live_objects as f64 / young as f64;
            let bytes = state.evacuated_bytes as f64 / young as f64;
            state.live_objects_per_region.add(live);
            state.evacuated_bytes_per_region.add(bytes);
            let promoted = (state.promoted_regions as f64 / young as f64).min(1.0);
            state.promoted_regions_share.add(promoted);
        }
        state.previous_collection_end = Some(now);
        tracing::trace!(
            target: "otter::gc",
            total_us = total,
            marking_us = marking,
            evacuation_us = evacuation,
            promotion_us = promotion,
            update_refs_us = update_refs,
            "pause analytics"
        );
    }

    fn predict_collection_time(&self, collection_set: &CollectionSet) -> Option<f64> {
        if self.state.lock().other_time.is_empty() {
            return None;
        }
        let young = self.predict_young_collection_time_us(collection_set.young().len());
        let old: f64 = collection_set
            .tenured()
            .iter()
            .map(|r| self.predict_old_collection_time_us(r))
            .sum();
        Some(young + old)
    }

    /// Predicted pause for a young collection of `eden_length` regions, µs.
    ///
    /// Regions expected to be promoted in place are priced at the promotion
    /// cost on top of the marking and copying work of an average region.
    pub fn predict_young_collection_time_us(&self, eden_length: usize) -> f64 {
        let promotion_cost = self.predict_promotion_cost_us();
        let state = self.state.lock();
        let p = &self.predictor;
        let per_object = p.predict(&state.marking_rate) + p.predict(&state.update_refs_rate);
        let per_region = p.predict(&state.live_objects_per_region) * per_object
            + p.predict(&state.evacuated_bytes_per_region) * p.predict(&state.copy_rate);
        let promoted = (eden_length as f64 * p.predict(&state.promoted_regions_share))
            .min(eden_length as f64);
        eden_length as f64 * per_region + promoted * promotion_cost + p.predict(&state.other_time)
    }

    /// Predicted cost of adding `region` to a collection, µs.
    pub fn predict_old_collection_time_us(&self, region: &Region) -> f64 {
        let state = self.state.lock();
        let p = &self.predictor;
        let live = region.live_bytes();
        let allocated = region.allocated_bytes().max(1);
        let live_objects = region.allocated_objects() as f64 * live as f64 / allocated as f64;
        let per_object = p.predict(&state.marking_rate) + p.predict(&state.update_refs_rate);
        live as f64 * p.predict(&state.copy_rate)
            + live_objects * per_object
            + region.remset().card_count() as f64 * p.predict(&state.remset_scan_rate)
    }

    /// Expected gap between predicted and actual pauses, µs.
    pub fn estimate_prediction_error_us(&self) -> f64 {
        self.predictor.predict(&self.state.lock().prediction_error)
    }

    /// Eden regions filled per µs of mutator time.
    pub fn predict_allocation_rate(&self) -> f64 {
        self.predictor.predict(&self.state.lock().allocation_rate)
    }

    /// Cost of promoting one region in place, µs.
    fn predict_promotion_cost_us(&self) -> f64 {
        self.predictor.predict(&self.state.lock().promotion_cost)
    }
}
