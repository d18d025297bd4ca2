//! Admission-control properties at the service level: a burst of triggers
//! never exceeds the configured concurrency, and every slot is reclaimed.

mod common;

use common::Harness;
use dbackup::execution::ExecutionStatus;
use serde_json::json;

#[tokio::test]
async fn test_burst_of_triggers_never_exceeds_limit() {
    let limit = 2;
    let harness = Harness::new(limit);
    let source = harness.scripted_source("slow-db", json!({ "dumpSleepMs": 120 }));
    let destination = harness.local_destination("local");
    let job = harness
        .service
        .create_job("tests", harness.job_spec("burst", source, destination))
        .unwrap();

    let mut execution_ids = Vec::new();
    for _ in 0..8 {
        execution_ids.push(harness.service.trigger_job("tests", job.id).unwrap());
    }

    // sample the running gauge while the burst drains
    let mut peak_running = 0usize;
    let mut peak_running_records = 0usize;
    for _ in 0..1500 {
        peak_running = peak_running.max(harness.service.running_pipelines());
        let running_records = harness
            .service
            .get_executions()
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count();
        peak_running_records = peak_running_records.max(running_records);

        let terminal = execution_ids
            .iter()
            .filter(|id| {
                harness
                    .service
                    .get_execution(**id, false)
                    .map(|e| {
                        matches!(e.status, ExecutionStatus::Success | ExecutionStatus::Failed)
                    })
                    .unwrap_or(false)
            })
            .count();
        if terminal == execution_ids.len() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let all_terminal = execution_ids.iter().all(|id| {
        harness
            .service
            .get_execution(*id, false)
            .map(|e| matches!(e.status, ExecutionStatus::Success | ExecutionStatus::Failed))
            .unwrap_or(false)
    });
    assert!(all_terminal, "burst did not drain in time");

    assert!(
        peak_running <= limit,
        "pipeline gauge peaked at {} with limit {}",
        peak_running,
        limit
    );
    assert!(
        peak_running_records <= limit,
        "running executions peaked at {} with limit {}",
        peak_running_records,
        limit
    );
    assert_eq!(harness.service.running_pipelines(), 0, "all slots reclaimed");

    for id in execution_ids {
        let execution = harness.service.get_execution(id, false).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
    }
}

#[tokio::test]
async fn test_limit_change_applies_to_future_admissions() {
    let harness = Harness::new(1);
    let source = harness.scripted_source("slow-db", json!({ "dumpSleepMs": 100 }));
    let destination = harness.local_destination("local");
    let job = harness
        .service
        .create_job("tests", harness.job_spec("resize", source, destination))
        .unwrap();

    let first = harness.service.trigger_job("tests", job.id).unwrap();
    harness.service.set_max_concurrent_jobs(4);
    let rest: Vec<_> = (0..4)
        .map(|_| harness.service.trigger_job("tests", job.id).unwrap())
        .collect();

    harness.wait_terminal(first).await;
    for id in rest {
        let execution = harness.wait_terminal(id).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
    }
    assert_eq!(harness.service.running_pipelines(), 0);
}
