//! Domain reputation scoring
//!
//! Advisory only: scores are recorded for operators and never consulted by
//! delivery.

use chrono::{Duration, Utc};

use crate::data::{Database, DomainReputation, OutboxStatus};
use crate::error::AppError;

const SPAM_WINDOW_DAYS: i64 = 30;
const DELIVERY_WINDOW_HOURS: i64 = 24;

/// `100 - 20*spam - 5*failures + 2*successes`, clamped to `0..=100`
pub fn score(spam_signals: i64, failures: i64, successes: i64) -> i64 {
    let raw = 100i64
        .saturating_sub(spam_signals.saturating_mul(20))
        .saturating_sub(failures.saturating_mul(5))
        .saturating_add(successes.saturating_mul(2));
    raw.clamp(0, 100)
}

/// Recompute and store the score of every known domain
///
/// Returns the number of domains scored.
pub async fn recalculate(db: &Database) -> Result<usize, AppError> {
    let now = Utc::now();
    let spam_since = now - Duration::days(SPAM_WINDOW_DAYS);
    let delivery_since = now - Duration::hours(DELIVERY_WINDOW_HOURS);

    let domains = db.list_known_domains().await?;
    for domain in &domains {
        let spam_count = db.count_spam_signals(domain, spam_since).await?;
        let failure_count = db
            .count_deliveries(domain, OutboxStatus::Failed, delivery_since)
            .await?;
        let success_count = db
            .count_deliveries(domain, OutboxStatus::Sent, delivery_since)
            .await?;

        let reputation = DomainReputation {
            domain: domain.clone(),
            reputation_score: score(spam_count, failure_count, success_count),
            spam_count,
            failure_count,
            success_count,
            updated_at: now,
        };
        tracing::debug!(
            %domain,
            score = reputation.reputation_score,
            spam_count,
            failure_count,
            success_count,
            "Domain reputation updated"
        );
        db.upsert_reputation(&reputation).await?;
    }

    Ok(domains.len())
}
