//! Frame Validator: detects decoder-failure artifacts on decoded RGBA
//! frames and replays the last good frame rather than forwarding garbage
//! downstream (spec.md §4.9).
//!
//! Modeled as an explicit finite-state machine per spec.md §9 ("rather than
//! accumulating booleans") instead of the loose counter fields a capture
//! pipeline's health-check logic tends to use.

use crate::codec::RgbaFrame;

const GREEN_DOMINANCE_SAMPLE_STRIDE: usize = 16;
const GREEN_DOMINANCE_MARGIN: i32 = 30;
const GREEN_DOMINANCE_THRESHOLD: f64 = 0.006;

const MACRO_BLOCK_SIZE: usize = 16;
const MACRO_BLOCK_LUMA_DELTA: i32 = 80;
const MACRO_BLOCK_THRESHOLD: f64 = 0.030;

const FRAME_CHANGE_SAMPLE_STRIDE: usize = 8;
const FRAME_CHANGE_PIXEL_THRESHOLD: i32 = 150;
const FRAME_CHANGE_RATIO_THRESHOLD: f64 = 0.30;

/// Disabled by default per spec.md §9 open question 2 — left at its
/// effectively-disabled value rather than guessed at.
const HISTOGRAM_DRIFT_THRESHOLD: f64 = 1.00;

const MAX_CONSECUTIVE_INVALID: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorState {
    Ok,
    InvalidStreak(u32),
    AwaitingKeyframe,
}

pub struct ValidationOutcome {
    pub valid: bool,
    pub needs_keyframe: bool,
}

pub struct FrameValidator {
    state: ValidatorState,
    last_good_frame: Option<RgbaFrame>,
    frame_count: u64,
    invalid_frame_count: u64,
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameValidator {
    pub fn new() -> Self {
        Self {
            state: ValidatorState::Ok,
            last_good_frame: None,
            frame_count: 0,
            invalid_frame_count: 0,
        }
    }

    pub fn invalid_frame_count(&self) -> u64 {
        self.invalid_frame_count
    }

    pub fn state(&self) -> ValidatorState {
        self.state
    }

    /// Validate one decoded frame. Returns the frame to emit (the input
    /// frame if valid, the last good frame at the new PTS if one exists, or
    /// `None` if the frame is invalid and no good frame has arrived yet —
    /// there is nothing safe to replay, so the frame is suppressed rather
    /// than forwarding garbage) and whether a fresh keyframe should be
    /// requested.
    pub fn validate_frame(&mut self, frame: &RgbaFrame, is_keyframe: bool) -> (Option<RgbaFrame>, ValidationOutcome) {
        self.frame_count += 1;

        let green = green_dominance_ratio(frame);
        let macro_blocking = macro_blocking_ratio(frame);
        let (frame_change, histogram) = if is_keyframe {
            (0.0, 0.0)
        } else {
            let prev = self.last_good_frame.as_ref();
            (
                prev.map(|p| frame_change_ratio(frame, p)).unwrap_or(0.0),
                prev.map(|p| histogram_drift(frame, p)).unwrap_or(0.0),
            )
        };

        let valid = green <= GREEN_DOMINANCE_THRESHOLD
            && macro_blocking <= MACRO_BLOCK_THRESHOLD
            && frame_change <= FRAME_CHANGE_RATIO_THRESHOLD
            && histogram <= HISTOGRAM_DRIFT_THRESHOLD;

        if valid {
            self.state = ValidatorState::Ok;
            self.last_good_frame = Some(frame.clone());
            return (
                Some(frame.clone()),
                ValidationOutcome {
                    valid: true,
                    needs_keyframe: false,
                },
            );
        }

        self.invalid_frame_count += 1;
        let streak = match self.state {
            ValidatorState::InvalidStreak(k) => k + 1,
            _ => 1,
        };

        let needs_keyframe = streak >= MAX_CONSECUTIVE_INVALID;
        self.state = if needs_keyframe {
            ValidatorState::AwaitingKeyframe
        } else {
            ValidatorState::InvalidStreak(streak)
        };

        (
            self.last_good_frame.clone(),
            ValidationOutcome {
                valid: false,
                needs_keyframe,
            },
        )
    }

    /// Called when a keyframe arrives; resets the streak regardless of the
    /// keyframe's own validation outcome (validate_frame handles that).
    pub fn note_keyframe_arrived(&mut self) {
        if matches!(self.state, ValidatorState::AwaitingKeyframe) {
            self.state = ValidatorState::Ok;
        }
    }
}

fn luma(r: u8, g: u8, b: u8) -> i32 {
    // BT.601: Y = 0.299 R + 0.587 G + 0.114 B, fixed-point.
    (299 * r as i32 + 587 * g as i32 + 114 * b as i32) / 1000
}

fn green_dominance_ratio(frame: &RgbaFrame) -> f64 {
    let pixel_count = frame.width * frame.height;
    if pixel_count == 0 {
        return 0.0;
    }
    let mut sampled = 0usize;
    let mut flagged = 0usize;
    let mut i = 0usize;
    while i < pixel_count {
        let idx = i * 4;
        let r = frame.data[idx] as i32;
        let g = frame.data[idx + 1] as i32;
        let b = frame.data[idx + 2] as i32;
        sampled += 1;
        if g > r + GREEN_DOMINANCE_MARGIN && g > b + GREEN_DOMINANCE_MARGIN {
            flagged += 1;
        }
        i += GREEN_DOMINANCE_SAMPLE_STRIDE;
    }
    if sampled == 0 {
        0.0
    } else {
        flagged as f64 / sampled as f64
    }
}

fn macro_blocking_ratio(frame: &RgbaFrame) -> f64 {
    let mut boundaries = 0usize;
    let mut anomalies = 0usize;

    let mut col = MACRO_BLOCK_SIZE;
    while col < frame.width {
        for row in 0..frame.height {
            let left = pixel_luma(frame, col - 1, row);
            let right = pixel_luma(frame, col, row);
            boundaries += 1;
            if (left - right).abs() > MACRO_BLOCK_LUMA_DELTA {
                anomalies += 1;
            }
        }
        col += MACRO_BLOCK_SIZE;
    }

    let mut row = MACRO_BLOCK_SIZE;
    while row < frame.height {
        for col in 0..frame.width {
            let top = pixel_luma(frame, col, row - 1);
            let bottom = pixel_luma(frame, col, row);
            boundaries += 1;
            if (top - bottom).abs() > MACRO_BLOCK_LUMA_DELTA {
                anomalies += 1;
            }
        }
        row += MACRO_BLOCK_SIZE;
    }

    if boundaries == 0 {
        0.0
    } else {
        anomalies as f64 / boundaries as f64
    }
}

fn pixel_luma(frame: &RgbaFrame, col: usize, row: usize) -> i32 {
    let idx = (row * frame.width + col) * 4;
    luma(frame.data[idx], frame.data[idx + 1], frame.data[idx + 2])
}

fn frame_change_ratio(frame: &RgbaFrame, prev: &RgbaFrame) -> f64 {
    if frame.width != prev.width || frame.height != prev.height {
        return 1.0;
    }
    let pixel_count = frame.width * frame.height;
    if pixel_count == 0 {
        return 0.0;
    }
    let mut sampled = 0usize;
    let mut flagged = 0usize;
    let mut i = 0usize;
    while i < pixel_count {
        let idx = i * 4;
        let sum_diff = (frame.data[idx] as i32 - prev.data[idx] as i32).abs()
            + (frame.data[idx + 1] as i32 - prev.data[idx + 1] as i32).abs()
            + (frame.data[idx + 2] as i32 - prev.data[idx + 2] as i32).abs();
        sampled += 1;
        if sum_diff > FRAME_CHANGE_PIXEL_THRESHOLD {
            flagged += 1;
        }
        i += FRAME_CHANGE_SAMPLE_STRIDE;
    }
    if sampled == 0 {
        0.0
    } else {
        flagged as f64 / sampled as f64
    }
}

/// Disabled by default (threshold 1.00, spec.md §9 open question 2); kept
/// implemented so a future non-default threshold has a working check.
fn histogram_drift(frame: &RgbaFrame, prev: &RgbaFrame) -> f64 {
    let mut hist_a = [0u32; 256];
    let mut hist_b = [0u32; 256];
    let pixel_count = frame.width * frame.height;
    for i in 0..pixel_count {
        let idx = i * 4;
        hist_a[luma(frame.data[idx], frame.data[idx + 1], frame.data[idx + 2]) as usize] += 1;
        if i * 4 + 2 < prev.data.len() {
            hist_b[luma(prev.data[idx], prev.data[idx + 1], prev.data[idx + 2]) as usize] += 1;
        }
    }
    let total = pixel_count.max(1) as f64;
    let mut diff = 0.0;
    for i in 0..256 {
        diff += (hist_a[i] as f64 - hist_b[i] as f64).abs() / total;
    }
    diff / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: usize, height: usize, r: u8, g: u8, b: u8) -> RgbaFrame {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_mut(4) {
            px[0] = r;
            px[1] = g;
            px[2] = b;
            px[3] = 255;
        }
        RgbaFrame { width, height, data }
    }

    #[test]
    fn valid_frame_passes_and_becomes_last_good() {
        let mut v = FrameValidator::new();
        let frame = solid_frame(32, 32, 100, 100, 100);
        let (emitted, outcome) = v.validate_frame(&frame, true);
        assert!(outcome.valid);
        assert_eq!(emitted.unwrap().data, frame.data);
        assert_eq!(v.invalid_frame_count(), 0);
    }

    #[test]
    fn green_dominant_frame_is_rejected_and_replays_last_good() {
        let mut v = FrameValidator::new();
        let good = solid_frame(32, 32, 100, 100, 100);
        v.validate_frame(&good, true);

        let green_screen = solid_frame(32, 32, 0, 255, 0);
        let (emitted, outcome) = v.validate_frame(&green_screen, false);
        assert!(!outcome.valid);
        assert_eq!(emitted.unwrap().data, good.data);
        assert_eq!(v.invalid_frame_count(), 1);
    }

    #[test]
    fn five_consecutive_failures_request_keyframe() {
        let mut v = FrameValidator::new();
        let good = solid_frame(32, 32, 100, 100, 100);
        v.validate_frame(&good, true);

        let bad = solid_frame(32, 32, 0, 255, 0);
        let mut last_outcome = None;
        for _ in 0..5 {
            let (_, outcome) = v.validate_frame(&bad, false);
            last_outcome = Some(outcome);
        }
        assert!(last_outcome.unwrap().needs_keyframe);
        assert_eq!(v.state(), ValidatorState::AwaitingKeyframe);
    }

    #[test]
    fn invalid_frame_before_any_good_frame_is_suppressed_not_replayed() {
        let mut v = FrameValidator::new();
        let green_screen = solid_frame(32, 32, 0, 255, 0);
        let (emitted, outcome) = v.validate_frame(&green_screen, false);
        assert!(!outcome.valid);
        assert!(emitted.is_none());
        assert_eq!(v.invalid_frame_count(), 1);
    }

    #[test]
    fn keyframe_arrival_resets_awaiting_state() {
        let mut v = FrameValidator::new();
        v.state = ValidatorState::AwaitingKeyframe;
        v.note_keyframe_arrived();
        assert_eq!(v.state(), ValidatorState::Ok);
    }

    #[test]
    fn validate_does_not_mutate_state_beyond_last_good_and_count_on_valid_frames() {
        let mut v = FrameValidator::new();
        let frame = solid_frame(16, 16, 50, 50, 50);
        v.validate_frame(&frame, true);
        let count_before = v.frame_count;
        v.validate_frame(&frame, false);
        assert_eq!(v.frame_count, count_before + 1);
        assert_eq!(v.state(), ValidatorState::Ok);
    }
}
