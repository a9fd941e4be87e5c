use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::TraversalMode;
use crate::core::retry::RetryReason;
use crate::taxonomy::{CategoryId, SourceId};

#[derive(Debug, Clone, Serialize)]
pub struct HarvestStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub transport_errors: usize,
    pub retry_count: usize,
    pub bytes_downloaded: usize,
    pub status_codes: HashMap<u16, usize>,
    pub retry_reasons: HashMap<RetryReason, usize>,
    pub average_response_time: f64, // in milliseconds
    pub pages_collected: usize,
    pub items_emitted: usize,
    pub sessions_created: usize,
    pub session_rebuilds: usize,
}

#[derive(Debug, Clone)]
pub struct StatsTracker {
    stats: Arc<RwLock<HarvestStats>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(HarvestStats {
                start_time: Utc::now(),
                end_time: None,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                transport_errors: 0,
                retry_count: 0,
                bytes_downloaded: 0,
                status_codes: HashMap::new(),
                retry_reasons: HashMap::new(),
                average_response_time: 0.0,
                pages_collected: 0,
                items_emitted: 0,
                sessions_created: 0,
                session_rebuilds: 0,
            })),
        }
    }

    pub fn record_request(&self, status: u16, size: usize, duration: Duration) {
        let mut stats = self.stats.write();
        stats.total_requests += 1;

        if status < 400 {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }

        *stats.status_codes.entry(status).or_insert(0) += 1;
        stats.bytes_downloaded += size;

        let responses = stats.total_requests - stats.transport_errors;
        let current_total = stats.average_response_time * (responses - 1) as f64;
        let new_duration = duration.as_secs_f64() * 1000.0;
        stats.average_response_time = (current_total + new_duration) / responses as f64;
    }

    pub fn record_transport_error(&self) {
        let mut stats = self.stats.write();
        stats.total_requests += 1;
        stats.failed_requests += 1;
        stats.transport_errors += 1;
    }

    pub fn record_retry(&self, reason: RetryReason) {
        let mut stats = self.stats.write();
        stats.retry_count += 1;
        *stats.retry_reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn record_page(&self, items: usize) {
        let mut stats = self.stats.write();
        stats.pages_collected += 1;
        stats.items_emitted += items;
    }

    pub fn record_session(&self, rebuild: bool) {
        let mut stats = self.stats.write();
        stats.sessions_created += 1;
        if rebuild {
            stats.session_rebuilds += 1;
        }
    }

    pub fn finish(&self) {
        self.stats.write().end_time = Some(Utc::now());
    }

    pub fn get_stats(&self) -> HarvestStats {
        self.stats.read().clone()
    }

    pub fn print_summary(&self) {
        let stats = self.stats.read();
        let duration = stats
            .end_time
            .unwrap_or_else(Utc::now)
            .signed_duration_since(stats.start_time);

        println!("\nHarvest Statistics:");
        println!("===================");
        println!("Duration: {} seconds", duration.num_seconds());
        println!("Total Requests: {}", stats.total_requests);
        println!("Successful Requests: {}", stats.successful_requests);
        println!("Failed Requests: {}", stats.failed_requests);
        println!("Transport Errors: {}", stats.transport_errors);
        println!("Retry Count: {}", stats.retry_count);
        println!(
            "Data Downloaded: {:.2} MB",
            stats.bytes_downloaded as f64 / 1_000_000.0
        );
        println!(
            "Average Response Time: {:.2}ms",
            stats.average_response_time
        );
        println!("Pages Collected: {}", stats.pages_collected);
        println!("Items Emitted: {}", stats.items_emitted);
        println!(
            "Sessions: {} ({} rebuilds)",
            stats.sessions_created, stats.session_rebuilds
        );

        println!("\nStatus Codes:");
        for (code, count) in &stats.status_codes {
            println!("  {}: {}", code, count);
        }

        if !stats.retry_reasons.is_empty() {
            println!("\nRetry Reasons:");
            for (reason, count) in &stats.retry_reasons {
                println!("  {:?}: {}", reason, count);
            }
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CategoryOutcome {
    Completed,
    /// Already finished earlier in this pass.
    Skipped,
    Failed { reason: String },
    /// Interrupted by shutdown or a run halt; resumable.
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category_id: CategoryId,
    pub category_name: String,
    pub outcome: CategoryOutcome,
    pub pages: u32,
    pub items: usize,
}

/// Partial-success summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub source_id: SourceId,
    pub mode: TraversalMode,
    pub pass: u32,
    pub categories: Vec<CategoryReport>,
    pub halted: Option<String>,
    pub cancelled: bool,
}

impl HarvestReport {
    pub fn new(source_id: SourceId, mode: TraversalMode, pass: u32) -> Self {
        Self {
            source_id,
            mode,
            pass,
            categories: Vec::new(),
            halted: None,
            cancelled: false,
        }
    }

    pub fn category(&self, id: CategoryId) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category_id == id)
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, CategoryOutcome::Completed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CategoryOutcome::Failed { .. }))
    }

    pub fn total_pages(&self) -> u32 {
        self.categories.iter().map(|c| c.pages).sum()
    }

    pub fn total_items(&self) -> usize {
        self.categories.iter().map(|c| c.items).sum()
    }

    fn count(&self, predicate: impl Fn(&CategoryOutcome) -> bool) -> usize {
        self.categories
            .iter()
            .filter(|c| predicate(&c.outcome))
            .count()
    }

    pub fn print_summary(&self) {
        println!("\nHarvest Report ({}, pass {}, {:?}):", self.source_id, self.pass, self.mode);
        println!("===================");
        for category in &self.categories {
            println!(
                "  {} ({}): {:?}, {} pages, {} items",
                category.category_name,
                category.category_id,
                category.outcome,
                category.pages,
                category.items
            );
        }
        println!(
            "Completed: {}, Failed: {}, Pages: {}, Items: {}",
            self.completed(),
            self.failed(),
            self.total_pages(),
            self.total_items()
        );
        if let Some(reason) = &self.halted {
            println!("Run halted: {}", reason);
        }
        if self.cancelled {
            println!("Run cancelled by operator");
        }
    }
}
