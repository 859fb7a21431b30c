/// Generalized hardware events that can back a counter monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfEvent {
    CpuCycles,
    Instructions,
    CacheReferences,
    CacheMisses,
    BranchInstructions,
    BranchMisses,
    BusCycles,
    StalledCyclesFrontend,
    StalledCyclesBackend,
}

impl PerfEvent {
    pub fn to_perf_string(&self) -> &'static str {
        match self {
            PerfEvent::CpuCycles => "cpu-cycles",
            PerfEvent::Instructions => "instructions",
            PerfEvent::CacheReferences => "cache-references",
            PerfEvent::CacheMisses => "cache-misses",
            PerfEvent::BranchInstructions => "branch-instructions",
            PerfEvent::BranchMisses => "branch-misses",
            PerfEvent::BusCycles => "bus-cycles",
            PerfEvent::StalledCyclesFrontend => "stalled-cycles-frontend",
            PerfEvent::StalledCyclesBackend => "stalled-cycles-backend",
        }
    }

    /// Name of the matching `PERF_COUNT_HW_*` constant in `linux/perf_event.h`.
    pub fn to_kernel_name(&self) -> &'static str {
        match self {
            PerfEvent::CpuCycles => "PERF_COUNT_HW_CPU_CYCLES",
            PerfEvent::Instructions => "PERF_COUNT_HW_INSTRUCTIONS",
            PerfEvent::CacheReferences => "PERF_COUNT_HW_CACHE_REFERENCES",
            PerfEvent::CacheMisses => "PERF_COUNT_HW_CACHE_MISSES",
            PerfEvent::BranchInstructions => "PERF_COUNT_HW_BRANCH_INSTRUCTIONS",
            PerfEvent::BranchMisses => "PERF_COUNT_HW_BRANCH_MISSES",
            PerfEvent::BusCycles => "PERF_COUNT_HW_BUS_CYCLES",
            PerfEvent::StalledCyclesFrontend => "PERF_COUNT_HW_STALLED_CYCLES_FRONTEND",
            PerfEvent::StalledCyclesBackend => "PERF_COUNT_HW_STALLED_CYCLES_BACKEND",
        }
    }

    /// Value of `perf_event_attr.config` for `PERF_TYPE_HARDWARE`.
    pub fn hardware_config(&self) -> u64 {
        match self {
            PerfEvent::CpuCycles => 0,
            PerfEvent::Instructions => 1,
            PerfEvent::CacheReferences => 2,
            PerfEvent::CacheMisses => 3,
            PerfEvent::BranchInstructions => 4,
            PerfEvent::BranchMisses => 5,
            PerfEvent::BusCycles => 6,
            PerfEvent::StalledCyclesFrontend => 7,
            PerfEvent::StalledCyclesBackend => 8,
        }
    }

    /// Accepts both the perf tool spelling (`cpu-cycles`) and the kernel constant
    /// (`PERF_COUNT_HW_CPU_CYCLES`).
    pub fn from_perf_string(event: &str) -> Option<PerfEvent> {
        Self::all_events()
            .into_iter()
            .find(|e| e.to_perf_string() == event || e.to_kernel_name() == event)
    }

    pub fn all_events() -> Vec<PerfEvent> {
        vec![
            PerfEvent::CpuCycles,
            PerfEvent::Instructions,
            PerfEvent::CacheReferences,
            PerfEvent::CacheMisses,
            PerfEvent::BranchInstructions,
            PerfEvent::BranchMisses,
            PerfEvent::BusCycles,
            PerfEvent::StalledCyclesFrontend,
            PerfEvent::StalledCyclesBackend,
        ]
    }
}

impl std::fmt::Display for PerfEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_perf_string())
    }
}
