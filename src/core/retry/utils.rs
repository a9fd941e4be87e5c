use super::types::*;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;

pub fn check_content_condition(condition: &ContentRetryCondition, content: &str) -> bool {
    if condition.is_regex {
        Regex::new(&condition.pattern)
            .map(|re| re.is_match(content))
            .unwrap_or(false)
    } else {
        content
            .to_lowercase()
            .contains(&condition.pattern.to_lowercase())
    }
}

pub fn calculate_delay(config: &BackoffConfig, attempt: usize) -> Duration {
    if attempt == 0 {
        return std::cmp::min(config.initial_delay, config.max_delay);
    }

    let delay = match config.backoff_policy {
        BackoffPolicy::Constant => config.initial_delay,
        BackoffPolicy::Linear => config
            .initial_delay
            .saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX)),
        BackoffPolicy::Exponential { factor } => {
            let nanos = config.initial_delay.as_nanos() as f64 * f64::from(factor).powi(attempt as i32);
            if !nanos.is_finite() || nanos >= config.max_delay.as_nanos() as f64 {
                config.max_delay
            } else {
                Duration::from_nanos(nanos.round() as u64)
            }
        }
    };

    std::cmp::min(delay, config.max_delay)
}

/// Parses a `Retry-After` value, either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc).signed_duration_since(now);
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
