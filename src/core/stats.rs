use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub enum EngineStatKind {
    SchedulerLoop,
    Command,
    CommandYield,
    PageOperation,
    PageOperationRetry,
    PeriodicTask,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EngineStatsSnapshot {
    pub scheduler_loops: u64,
    pub commands: u64,
    pub command_yields: u64,
    pub page_operations: u64,
    pub page_operation_retries: u64,
    pub periodic_tasks: u64,
}

#[derive(Debug, Default)]
struct EngineStats {
    scheduler_loops: AtomicU64,
    commands: AtomicU64,
    command_yields: AtomicU64,
    page_operations: AtomicU64,
    page_operation_retries: AtomicU64,
    periodic_tasks: AtomicU64,
}

impl EngineStats {
    fn counter(&self, kind: EngineStatKind) -> &AtomicU64 {
        match kind {
            EngineStatKind::SchedulerLoop => &self.scheduler_loops,
            EngineStatKind::Command => &self.commands,
            EngineStatKind::CommandYield => &self.command_yields,
            EngineStatKind::PageOperation => &self.page_operations,
            EngineStatKind::PageOperationRetry => &self.page_operation_retries,
            EngineStatKind::PeriodicTask => &self.periodic_tasks,
        }
    }
}

static GLOBAL_ENGINE_STATS: OnceLock<EngineStats> = OnceLock::new();

fn global_engine_stats() -> &'static EngineStats {
    GLOBAL_ENGINE_STATS.get_or_init(EngineStats::default)
}

pub fn record_stat(kind: EngineStatKind) {
    global_engine_stats()
        .counter(kind)
        .fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot_engine_stats() -> EngineStatsSnapshot {
    let stats = global_engine_stats();
    EngineStatsSnapshot {
        scheduler_loops: stats.scheduler_loops.load(Ordering::Relaxed),
        commands: stats.commands.load(Ordering::Relaxed),
        command_yields: stats.command_yields.load(Ordering::Relaxed),
        page_operations: stats.page_operations.load(Ordering::Relaxed),
        page_operation_retries: stats.page_operation_retries.load(Ordering::Relaxed),
        periodic_tasks: stats.periodic_tasks.load(Ordering::Relaxed),
    }
}

pub fn reset_engine_stats() {
    let stats = global_engine_stats();
    stats.scheduler_loops.store(0, Ordering::Relaxed);
    stats.commands.store(0, Ordering::Relaxed);
    stats.command_yields.store(0, Ordering::Relaxed);
    stats.page_operations.store(0, Ordering::Relaxed);
    stats.page_operation_retries.store(0, Ordering::Relaxed);
    stats.periodic_tasks.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_snapshot_reset_round_trip() {
        reset_engine_stats();
        record_stat(EngineStatKind::Command);
        record_stat(EngineStatKind::Command);
        record_stat(EngineStatKind::CommandYield);
        let snapshot = snapshot_engine_stats();
        assert!(snapshot.commands >= 2);
        assert!(snapshot.command_yields >= 1);

        // No scheduler runs in this test binary, so nothing else records
        // command counters concurrently.
        reset_engine_stats();
        assert_eq!(snapshot_engine_stats().commands, 0);
    }
}
