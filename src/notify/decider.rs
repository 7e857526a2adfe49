//! # Notify Decider
//! Pure decision logic for whether a scored listing warrants a webhook
//! notification, given what the repository already knows about it.
//!
//! | Existing?          | Condition                        | Decision       |
//! |--------------------|----------------------------------|----------------|
//! | none               | score ≥ min                      | new            |
//! | none               | otherwise                        | score_too_low  |
//! | notified already   | price < 95% of old price         | price_dropped  |
//! | notified already   | score gained ≥ 10 points         | score_increased|
//! | notified already   | otherwise                        | already_notified |
//! | not yet notified   | score ≥ min                      | score_threshold|
//! | not yet notified   | otherwise                        | score_too_low  |

use serde::Serialize;

use crate::model::Annonce;

/// Price must drop below this fraction of the old price to re-notify.
const PRICE_DROP_FACTOR: f64 = 0.95;
/// Score must gain at least this many points to re-notify.
const SCORE_GAIN_MIN: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyReason {
    New,
    ScoreTooLow,
    PriceDropped,
    ScoreIncreased,
    AlreadyNotified,
    ScoreThreshold,
}

impl NotifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyReason::New => "new",
            NotifyReason::ScoreTooLow => "score_too_low",
            NotifyReason::PriceDropped => "price_dropped",
            NotifyReason::ScoreIncreased => "score_increased",
            NotifyReason::AlreadyNotified => "already_notified",
            NotifyReason::ScoreThreshold => "score_threshold",
        }
    }
}

/// Outcome plus the deltas an update notification should display.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyDecision {
    pub notify: bool,
    pub reason: NotifyReason,
    /// True for price_dropped / score_increased re-notifications.
    pub is_update: bool,
    pub old_price: Option<u32>,
    pub old_score: Option<i32>,
}

impl NotifyDecision {
    fn no(reason: NotifyReason) -> Self {
        Self {
            notify: false,
            reason,
            is_update: false,
            old_price: None,
            old_score: None,
        }
    }

    fn fresh(reason: NotifyReason) -> Self {
        Self {
            notify: true,
            reason,
            is_update: false,
            old_price: None,
            old_score: None,
        }
    }

    /// Percent price drop relative to the previous price, when applicable.
    pub fn price_drop_pct(&self, new: &Annonce) -> Option<f64> {
        let old = self.old_price? as f64;
        let current = new.price? as f64;
        (old > 0.0).then(|| (1.0 - current / old) * 100.0)
    }

    pub fn score_delta(&self, new: &Annonce) -> Option<i32> {
        self.old_score.map(|old| new.score_total - old)
    }
}

/// Pure and deterministic: same `(new, existing, min_score)` always yields
/// the same decision.
pub fn should_notify(
    new: &Annonce,
    existing: Option<&Annonce>,
    min_score: i32,
) -> NotifyDecision {
    let Some(existing) = existing else {
        return if new.score_total >= min_score {
            NotifyDecision::fresh(NotifyReason::New)
        } else {
            NotifyDecision::no(NotifyReason::ScoreTooLow)
        };
    };

    if existing.notified {
        if let (Some(old_price), Some(new_price)) = (existing.price, new.price) {
            if old_price > 0 && (new_price as f64) < (old_price as f64) * PRICE_DROP_FACTOR {
                return NotifyDecision {
                    notify: true,
                    reason: NotifyReason::PriceDropped,
                    is_update: true,
                    old_price: Some(old_price),
                    old_score: Some(existing.score_total),
                };
            }
        }
        if new.score_total >= existing.score_total + SCORE_GAIN_MIN {
            return NotifyDecision {
                notify: true,
                reason: NotifyReason::ScoreIncreased,
                is_update: true,
                old_price: existing.price,
                old_score: Some(existing.score_total),
            };
        }
        return NotifyDecision::no(NotifyReason::AlreadyNotified);
    }

    if new.score_total >= min_score {
        NotifyDecision::fresh(NotifyReason::ScoreThreshold)
    } else {
        NotifyDecision::no(NotifyReason::ScoreTooLow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annonce(price: Option<u32>, score: i32, notified: bool) -> Annonce {
        Annonce {
            price,
            score_total: score,
            notified,
            ..Default::default()
        }
    }

    #[test]
    fn new_listing_above_threshold() {
        let new = annonce(Some(2000), 70, false);
        let d = should_notify(&new, None, 60);
        assert!(d.notify);
        assert_eq!(d.reason, NotifyReason::New);
        assert!(!d.is_update);
    }

    #[test]
    fn new_listing_below_threshold() {
        let new = annonce(Some(2000), 50, false);
        let d = should_notify(&new, None, 60);
        assert!(!d.notify);
        assert_eq!(d.reason, NotifyReason::ScoreTooLow);
    }

    #[test]
    fn price_drop_needs_five_percent() {
        let existing = annonce(Some(2000), 70, true);

        // 1850 < 2000 * 0.95 → update
        let dropped = annonce(Some(1850), 70, false);
        let d = should_notify(&dropped, Some(&existing), 60);
        assert!(d.notify);
        assert_eq!(d.reason, NotifyReason::PriceDropped);
        assert!(d.is_update);
        let pct = d.price_drop_pct(&dropped).unwrap();
        assert!((pct - 7.5).abs() < 0.01);

        // 1950 is only -2.5% → suppressed
        let nearly = annonce(Some(1950), 70, false);
        let d = should_notify(&nearly, Some(&existing), 60);
        assert!(!d.notify);
        assert_eq!(d.reason, NotifyReason::AlreadyNotified);
    }

    #[test]
    fn score_increase_needs_ten_points() {
        let existing = annonce(Some(2000), 62, true);

        let improved = annonce(Some(2000), 72, false);
        let d = should_notify(&improved, Some(&existing), 60);
        assert!(d.notify);
        assert_eq!(d.reason, NotifyReason::ScoreIncreased);
        assert_eq!(d.score_delta(&improved), Some(10));

        let slightly = annonce(Some(2000), 71, false);
        assert!(!should_notify(&slightly, Some(&existing), 60).notify);
    }

    #[test]
    fn existing_unnotified_uses_threshold() {
        let existing = annonce(Some(2000), 55, false);
        let new = annonce(Some(2000), 65, false);
        let d = should_notify(&new, Some(&existing), 60);
        assert!(d.notify);
        assert_eq!(d.reason, NotifyReason::ScoreThreshold);

        let weak = annonce(Some(2000), 55, false);
        let d = should_notify(&weak, Some(&existing), 60);
        assert!(!d.notify);
        assert_eq!(d.reason, NotifyReason::ScoreTooLow);
    }

    #[test]
    fn deterministic_on_same_inputs() {
        let existing = annonce(Some(2000), 70, true);
        let new = annonce(Some(1800), 70, false);
        let first = should_notify(&new, Some(&existing), 60);
        let second = should_notify(&new, Some(&existing), 60);
        assert_eq!(first, second);
    }
}
