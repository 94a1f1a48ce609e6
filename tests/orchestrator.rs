mod common;

use std::fs;

use common::{Calls, CountingPause, FakeBatchApi, Fixture};
use startup_classifier::{
    aggregate,
    config::{OnSubmitError, SchedulePolicy},
    responses::read_result_table,
    BatchState, Orchestrator,
};

#[tokio::test]
async fn parallel_run_classifies_every_record() {
    let fx = Fixture::new(27, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().in_progress_for(2);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    assert_eq!(orch.plan().batch_count, 3);

    let mut pause = CountingPause::default();
    let summary = orch.run(&mut pause, |_| {}).await.unwrap();

    assert!(summary.is_complete(), "{summary:?}");
    assert_eq!(summary.result_rows, 27);
    assert_eq!(summary.submitted_this_run, 3);
    assert_eq!(summary.downloaded_this_run, 3);
    assert_eq!(pause.pauses, 2);
    assert_eq!(
        orch.api().calls(),
        Calls { uploads: 3, creates: 3, retrieves: 9, downloads: 3 }
    );

    // the request files stay in the parallel schedule
    for n in 1..=3 {
        assert!(orch.layout().request_file(n).exists());
        assert_eq!(orch.layout().read_submission_id(n).unwrap(), Some(format!("batch-{n}")));
    }

    let rows = read_result_table(&orch.layout().output_csv(1)).unwrap();
    assert_eq!(rows.len(), 9);
    assert_eq!(rows[0].company_id, "org-000");
    assert_eq!(rows[0].company_name, "Company 0, Inc.");
    assert_eq!(rows[0].reasons, "builds models, sells APIs, hires researchers");
}

#[tokio::test]
async fn rerun_after_completion_does_no_remote_work() {
    let fx = Fixture::new(27, 10, SchedulePolicy::Parallel);
    let mut first = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).unwrap();
    first.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    let mut again = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).unwrap();
    assert!(again.slots().iter().all(|s| s.state == BatchState::Downloaded));

    let summary = again.run(&mut CountingPause::default(), |_| {}).await.unwrap();
    assert_eq!(summary.submitted_this_run, 0);
    assert_eq!(summary.downloaded_this_run, 0);
    assert_eq!(summary.result_rows, 27);
    assert_eq!(again.api().calls(), Calls::default());
}

#[tokio::test]
async fn schedules_produce_identical_merged_output() {
    let mut merged = Vec::new();
    for schedule in [SchedulePolicy::Parallel, SchedulePolicy::Sequential] {
        let fx = Fixture::new(23, 10, schedule);
        let api = FakeBatchApi::new().in_progress_for(1);
        let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
        let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();
        assert!(summary.is_complete());

        let report = aggregate::merge_batch_outputs(orch.layout(), Some(3), &fx.config.output_csv).unwrap();
        assert_eq!(report.rows, 23);
        assert!(report.missing.is_empty());
        merged.push(fs::read(&fx.config.output_csv).unwrap());
    }
    assert_eq!(merged[0], merged[1]);
}

#[tokio::test]
async fn sequential_drives_one_batch_at_a_time_and_removes_request_files() {
    let fx = Fixture::new(20, 10, SchedulePolicy::Sequential);
    let api = FakeBatchApi::new().in_progress_for(1);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();

    let round = orch.advance().await.unwrap();
    assert_eq!(round.submitted, 1);
    assert_eq!(orch.slots()[0].state, BatchState::InProgress);
    assert_eq!(orch.slots()[1].state, BatchState::Pending);
    assert!(!orch.layout().request_file(2).exists());

    let round = orch.advance().await.unwrap();
    assert_eq!(round.downloaded, 1);
    assert_eq!(round.submitted, 1);
    assert_eq!(orch.slots()[0].state, BatchState::Downloaded);
    assert!(!orch.layout().request_file(1).exists());

    let round = orch.advance().await.unwrap();
    assert!(round.is_finished());
    assert!(!orch.layout().request_file(2).exists());
    assert!(orch.layout().output_csv(2).exists());
}

#[tokio::test]
async fn failed_batch_is_reported_missing() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().failing(2);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    assert_eq!(summary.missing, vec![(2, BatchState::Failed)]);
    assert_eq!(summary.result_rows, 20);
    assert_eq!(summary.deficit(), 10);
    assert!(!orch.layout().output_csv(2).exists());

    let report = aggregate::merge_batch_outputs(orch.layout(), Some(3), &fx.config.output_csv).unwrap();
    assert_eq!(report.missing, vec![2]);
    assert_eq!(report.rows, 20);
}

#[tokio::test]
async fn submit_failure_leaves_batch_file_built_and_rerun_recovers() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().rejecting_upload(1);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    let first = &orch.slots()[0];
    assert_eq!(first.state, BatchState::FileBuilt);
    assert!(first.blocked);
    assert!(first.last_error.as_deref().unwrap().contains("upload rejected"));
    assert!(orch.layout().request_file(1).exists());
    assert!(!orch.layout().id_file(1).exists());
    // the other batches carried on
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.missing, vec![(1, BatchState::FileBuilt)]);

    let mut rerun = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).unwrap();
    assert_eq!(rerun.slots()[0].state, BatchState::FileBuilt);
    let summary = rerun.run(&mut CountingPause::default(), |_| {}).await.unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.submitted_this_run, 1);
    assert_eq!(rerun.api().calls().uploads, 1);
}

#[tokio::test]
async fn abort_policy_stops_further_submissions() {
    let mut fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    fx.config.on_submit_error = OnSubmitError::Abort;
    let api = FakeBatchApi::new().rejecting_upload(1);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    assert_eq!(orch.api().calls().uploads, 1);
    assert_eq!(orch.api().calls().creates, 0);
    assert_eq!(summary.submitted_this_run, 0);
    assert_eq!(summary.missing.len(), 3);
}

#[tokio::test]
async fn unparseable_lines_are_dropped_and_listed() {
    let fx = Fixture::new(12, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().garbling("startup-org-003");
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    assert_eq!(summary.result_rows, 11);
    assert_eq!(summary.dropped_lines, 1);
    assert_eq!(summary.deficit(), 1);
    assert!(summary.missing.is_empty());

    let issues: Vec<String> =
        serde_json::from_str(&fs::read_to_string(orch.layout().issues_file(1)).unwrap()).unwrap();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].starts_with("startup-org-003: completion has 3 fields"));
    let ids: Vec<String> = read_result_table(&orch.layout().output_csv(1))
        .unwrap()
        .into_iter()
        .map(|r| r.company_id)
        .collect();
    assert!(!ids.contains(&"org-003".to_string()));
}

#[tokio::test]
async fn oversized_request_file_is_refused_before_upload() {
    let mut fx = Fixture::new(5, 10, SchedulePolicy::Parallel);
    // room for the request count, not for the rendered bytes
    fx.config.limits.max_file_bytes = 1_024;
    fx.config.limits.est_bytes_per_request = 50.0;
    let mut orch = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).unwrap();
    let round = orch.advance().await.unwrap();

    assert_eq!(round.submit_failures, 1);
    assert_eq!(orch.api().calls().uploads, 0);
    assert_eq!(orch.slots()[0].state, BatchState::FileBuilt);
    assert!(orch.slots()[0].last_error.as_deref().unwrap().contains("above the 1024 byte limit"));
    assert!(round.is_finished());
}

#[tokio::test]
async fn missing_system_prompt_fails_before_any_remote_call() {
    let mut fx = Fixture::new(5, 10, SchedulePolicy::Parallel);
    fx.config.system_prompt_file = fx.dir.path().join("nope.txt");
    let err = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).err().unwrap();
    assert!(err.to_string().contains("system prompt not found"));
    assert!(!fx.work_file("batch_requests").exists());
}

#[tokio::test]
async fn transient_status_error_is_retried_next_round() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().failing_polls(1, 1);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();

    let round = orch.advance().await.unwrap();
    assert_eq!(round.poll_errors, 1);
    assert_eq!(round.downloaded, 2);
    assert_eq!(round.outstanding, 1);
    let first = &orch.slots()[0];
    assert_eq!(first.state, BatchState::Validating);
    assert!(!first.blocked);
    assert_eq!(first.poll_failures, 1);
    assert!(first.last_error.as_deref().unwrap().contains("503"));

    let round = orch.advance().await.unwrap();
    assert_eq!(round.poll_errors, 0);
    assert_eq!(round.downloaded, 1);
    assert!(round.is_finished());
    assert_eq!(orch.slots()[0].state, BatchState::Downloaded);
    assert_eq!(orch.slots()[0].poll_failures, 0);
    assert!(orch.slots()[0].last_error.is_none());
    assert!(orch.summary().is_complete());
}

#[tokio::test]
async fn repeated_status_errors_give_up_after_the_cap() {
    let mut fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    fx.config.max_poll_errors = 3;
    let api = FakeBatchApi::new().failing_polls(1, usize::MAX);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();

    let mut pause = CountingPause::default();
    let summary = orch.run(&mut pause, |_| {}).await.unwrap();

    assert_eq!(pause.pauses, 2);
    assert_eq!(summary.missing, vec![(1, BatchState::Validating)]);
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.result_rows, 20);
    let first = &orch.slots()[0];
    assert!(first.blocked);
    assert_eq!(first.poll_failures, 3);
    assert_eq!(orch.api().calls().retrieves, 3 + 2);
}

#[tokio::test]
async fn permanent_status_error_settles_the_batch() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().forgetting(2);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();

    let mut pause = CountingPause::default();
    let summary = orch.run(&mut pause, |_| {}).await.unwrap();

    assert_eq!(pause.pauses, 0);
    assert_eq!(summary.missing, vec![(2, BatchState::Validating)]);
    assert_eq!(summary.downloaded, 2);
    let second = &orch.slots()[1];
    assert!(second.blocked);
    assert!(second.last_error.as_deref().unwrap().contains("404"));
    assert_eq!(orch.api().calls().retrieves, 3);

    // the id stays on disk, so a rerun polls the batch again
    let rerun = Orchestrator::new(FakeBatchApi::new(), fx.config.clone()).unwrap();
    assert_eq!(rerun.slots()[1].state, BatchState::Submitted);
    assert!(!rerun.slots()[1].blocked);
}

#[tokio::test]
async fn interrupted_download_is_retried_next_round() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().failing_download_once(3);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();

    let round = orch.advance().await.unwrap();
    assert_eq!(round.downloaded, 2);
    let third = &orch.slots()[2];
    assert_eq!(third.state, BatchState::Completed);
    assert!(third.last_error.as_deref().unwrap().contains("download interrupted"));
    assert!(!orch.layout().raw_result_file(3).exists());
    assert!(!orch.layout().output_csv(3).exists());
    assert!(!round.is_finished());

    let round = orch.advance().await.unwrap();
    assert_eq!(round.polled, 0);
    assert_eq!(round.downloaded, 1);
    assert!(round.is_finished());
    assert!(orch.slots()[2].last_error.is_none());
    assert_eq!(orch.summary().result_rows, 30);
    assert_eq!(
        orch.api().calls(),
        Calls { uploads: 3, creates: 3, retrieves: 3, downloads: 4 }
    );
}

#[tokio::test]
async fn completed_batch_without_output_file_is_settled_and_missing() {
    let fx = Fixture::new(30, 10, SchedulePolicy::Parallel);
    let api = FakeBatchApi::new().completing_without_output(2);
    let mut orch = Orchestrator::new(api, fx.config.clone()).unwrap();
    let summary = orch.run(&mut CountingPause::default(), |_| {}).await.unwrap();

    assert_eq!(summary.missing, vec![(2, BatchState::Completed)]);
    assert_eq!(summary.result_rows, 20);
    assert_eq!(
        orch.slots()[1].last_error.as_deref(),
        Some("completed without an output file")
    );
    assert_eq!(orch.api().calls().downloads, 2);
}
