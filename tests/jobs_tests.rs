mod common;

use std::collections::HashMap;

use common::*;
use evm_label_crawler::heartbeat::{HeartbeatReporter, HeartbeatStatus};
use evm_label_crawler::jobs::{self, JobKind, PICKED_UP_TAG};
use evm_label_crawler::Blockchain;

fn numbered_address(i: usize) -> String {
    format!("0x{:040x}", 0x1000 + i)
}

#[tokio::test]
async fn test_job_entries_are_paged() {
    let journal = FakeJournal::default();
    for i in 0..250 {
        journal.add_entry(TRANSFER_ABI, &event_job_tags(&numbered_address(i), &[]), 100 + i as i64);
    }

    let entries = jobs::get_crawl_job_entries(&journal, "ethereum_smartcontract", JobKind::Event, None, &[])
        .await
        .unwrap();
    assert_eq!(entries.len(), 250);
    assert_eq!(journal.searches(), 3);

    let event_jobs = jobs::make_event_crawl_jobs(&entries).unwrap();
    assert_eq!(event_jobs.len(), 1);
    assert_eq!(event_jobs[0].contracts.len(), 250);
    assert_eq!(event_jobs[0].created_at, 349);
}

#[tokio::test]
async fn test_load_jobs_filters_by_chain_and_tags() {
    let journal = FakeJournal::default();
    journal.add_entry(TRANSFER_ABI, &event_job_tags(CONTRACT, &[]), 100);
    journal.add_entry(TRANSFER_FN_ABI, &function_job_tags(CONTRACT), 100);

    let mut polygon_tags = event_job_tags(OTHER_CONTRACT, &[]);
    polygon_tags.retain(|t| !t.starts_with("subscription_type:"));
    polygon_tags.push("subscription_type:polygon_smartcontract".to_string());
    journal.add_entry(TRANSFER_ABI, &polygon_tags, 100);

    let mut finished_tags = event_job_tags(OTHER_CONTRACT, &["historical_crawl_status:finished"]);
    finished_tags[0] = "abi_method_hash:other".to_string();
    journal.add_entry(TRANSFER_ABI, &finished_tags, 100);

    let (event_jobs, function_jobs) = jobs::load_jobs(&journal, Blockchain::Ethereum, &[]).await.unwrap();
    assert_eq!(event_jobs.len(), 2);
    assert_eq!(function_jobs.len(), 1);
    assert_eq!(function_jobs[0].contract_address, contract());

    let filters = vec!["!#historical_crawl_status:finished".to_string()];
    let (event_jobs, _) = jobs::load_jobs(&journal, Blockchain::Ethereum, &filters).await.unwrap();
    assert_eq!(event_jobs.len(), 1);
    assert_eq!(event_jobs[0].contracts, vec![contract()]);
}

#[tokio::test]
async fn test_refetch_uses_watermark_and_merges_idempotently() {
    let journal = FakeJournal::default();
    journal.add_entry(TRANSFER_ABI, &event_job_tags(CONTRACT, &[]), 100);

    let (mut event_jobs, mut function_jobs) = jobs::load_jobs(&journal, Blockchain::Ethereum, &[]).await.unwrap();
    journal.add_entry(TRANSFER_ABI, &event_job_tags(OTHER_CONTRACT, &[]), 200);
    journal.add_entry(TRANSFER_FN_ABI, &function_job_tags(CONTRACT), 150);

    let summary = jobs::refetch_new_jobs(&journal, Blockchain::Ethereum, &mut event_jobs, &mut function_jobs, &[])
        .await
        .unwrap();
    // Entries at the watermark come back as well
    assert_eq!(summary.event_entries, 2);
    assert_eq!(summary.function_entries, 1);
    assert_eq!(event_jobs.len(), 1);
    assert_eq!(event_jobs[0].contracts.len(), 2);
    assert_eq!(function_jobs.len(), 1);

    let before = (event_jobs.clone(), function_jobs.clone());
    let summary = jobs::refetch_new_jobs(&journal, Blockchain::Ethereum, &mut event_jobs, &mut function_jobs, &[])
        .await
        .unwrap();
    assert_eq!(summary.event_entries, 1);
    assert_eq!(summary.function_entries, 1);
    assert_eq!(event_jobs[0].contracts, before.0[0].contracts);
    assert_eq!(function_jobs[0].contract_abi.len(), before.1[0].contract_abi.len());
}

#[tokio::test]
async fn test_refetch_skips_malformed_entries() {
    let journal = FakeJournal::default();
    journal.add_entry(TRANSFER_ABI, &event_job_tags(CONTRACT, &[]), 100);
    let (mut event_jobs, mut function_jobs) = jobs::load_jobs(&journal, Blockchain::Ethereum, &[]).await.unwrap();

    let mut untagged = event_job_tags(OTHER_CONTRACT, &[]);
    untagged.retain(|t| !t.starts_with("abi_method_hash:"));
    journal.add_entry(TRANSFER_ABI, &untagged, 200);
    journal.add_entry("not an abi", &event_job_tags(&numbered_address(1), &[]), 200);
    journal.add_entry(TRANSFER_ABI, &event_job_tags(&numbered_address(2), &[]), 200);

    let summary = jobs::refetch_new_jobs(&journal, Blockchain::Ethereum, &mut event_jobs, &mut function_jobs, &[])
        .await
        .unwrap();
    assert_eq!(summary.event_entries, 4);
    assert_eq!(summary.skipped_entries, 2);
    assert_eq!(event_jobs.len(), 1);
    assert_eq!(event_jobs[0].contracts.len(), 2);
}

#[tokio::test]
async fn test_pick_up_tags_are_added_once() {
    let journal = FakeJournal::default();
    let event_id = journal.add_entry(TRANSFER_ABI, &event_job_tags(CONTRACT, &[]), 100);
    let function_id = journal.add_entry(TRANSFER_FN_ABI, &function_job_tags(CONTRACT), 100);

    let (mut event_jobs, mut function_jobs) = jobs::load_jobs(&journal, Blockchain::Ethereum, &[]).await.unwrap();
    assert_eq!(
        jobs::mark_jobs_picked_up(&journal, &mut event_jobs, &mut function_jobs).await.unwrap(),
        2
    );
    assert_eq!(
        jobs::mark_jobs_picked_up(&journal, &mut event_jobs, &mut function_jobs).await.unwrap(),
        0
    );

    for id in [event_id, function_id] {
        let entry = journal.entry(&id).unwrap();
        assert_eq!(entry.tags.iter().filter(|t| *t == PICKED_UP_TAG).count(), 1);
    }
}

#[tokio::test]
async fn test_progress_tags_replace_previous_value() {
    let journal = FakeJournal::default();
    let id = journal.add_entry(
        TRANSFER_ABI,
        &event_job_tags(CONTRACT, &["historical_crawl_status:in_progress"]),
        100,
    );
    let (mut event_jobs, mut function_jobs) = jobs::load_jobs(&journal, Blockchain::Ethereum, &[]).await.unwrap();

    let progress = HashMap::from([(contract(), 0.25)]);
    jobs::update_progress_tags(&journal, &mut event_jobs, &mut function_jobs, &progress)
        .await
        .unwrap();
    let progress = HashMap::from([(contract(), 0.5)]);
    jobs::update_progress_tags(&journal, &mut event_jobs, &mut function_jobs, &progress)
        .await
        .unwrap();

    let entry = journal.entry(&id).unwrap();
    assert!(entry.has_tag("progress:50.00"));
    assert!(!entry.has_tag("progress:25.00"));
    assert!(entry.has_tag("historical_crawl_status:in_progress"));
    assert!(!entry.has_tag("historical_crawl_status:finished"));
}

#[tokio::test]
async fn test_heartbeat_reuses_entry_until_dead() {
    let journal = FakeJournal::default();
    let reporter = HeartbeatReporter::new(std::sync::Arc::new(journal.clone()));

    let mut status = HeartbeatStatus {
        status: "crawling".into(),
        current_block: 10,
        ..Default::default()
    };
    reporter
        .heartbeat("continuous_crawler", Blockchain::Polygon, &status, false)
        .await
        .unwrap();
    status.current_block = 20;
    reporter
        .heartbeat("continuous_crawler", Blockchain::Polygon, &status, false)
        .await
        .unwrap();

    let entries = journal.find(&["continuous_crawler", "heartbeat", "polygon"]);
    assert_eq!(entries.len(), 1);
    let content: serde_json::Value = serde_json::from_str(&entries[0].content).unwrap();
    assert_eq!(content["current_block"], 20);

    reporter
        .heartbeat("continuous_crawler", Blockchain::Polygon, &status, true)
        .await
        .unwrap();
    assert!(journal.find(&["continuous_crawler", "heartbeat", "polygon"])[0].has_tag("dead"));

    // A restarted crawler gets a fresh entry
    reporter
        .heartbeat("continuous_crawler", Blockchain::Polygon, &status, false)
        .await
        .unwrap();
    assert_eq!(journal.find(&["continuous_crawler", "heartbeat", "polygon"]).len(), 2);
}
