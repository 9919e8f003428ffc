//! The stress driver end to end, configured the way a user would

use gc_cli::{Workload, WorkloadOptions};
use memory_manager::{CollectorPhase, GcConfig};

#[test]
fn test_driver_with_json_config() {
    let config = GcConfig::from_json(r#"{ "nursery_size": 32768, "zero_fill": false }"#).unwrap();
    let options = WorkloadOptions {
        threads: 4,
        rounds: 3,
        ops: 3_000,
        slots: 64,
        seed: 0x5eed,
    };
    let workload = Workload::new(config, options).unwrap();
    let report = workload.run().unwrap();

    assert_eq!(report.options.threads, 4);
    // Mutators trigger on their own on top of the coordinator rounds.
    assert!(report.heap.totals.cycles() > 4);
    assert_eq!(report.heap.phase, CollectorPhase::Idle);
    assert_eq!(report.heap.pending_finalizers, 0);
    assert!(report.heap.totals.finalizers_run > 0);

    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
    assert_eq!(json["heap"]["totals"]["major_cycles"], 1);
}
