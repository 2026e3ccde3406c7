//! End-to-end tests: stored transfers → window roll-up → approval verdicts
//!
//! Uses a real SQLite file with the production schema and drives the same
//! store, worker and read API the runtime binary wires together.

#[cfg(test)]
mod approval_pipeline_tests {
    use alloy_primitives::U256;
    use flowgate::approval::rules::{ANOMALY_SPIKE, CONTINUITY, DUPLICATION};
    use flowgate::approval::{ApprovalApi, ApprovalWorker, RuleEngine, ScoreBands, VerdictStatus, VerdictStore};
    use flowgate::pipeline::aggregates::AggregateStore;
    use flowgate::pipeline::{FlowDirection, SqliteStore, TrackedToken, TransferEvent, WindowSize};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    // 2024-01-01T00:00:00Z
    const BASE: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;

    struct Harness {
        _db: NamedTempFile,
        store: SqliteStore,
        api: ApprovalApi,
    }

    fn harness(tokens: &[(&str, &str)]) -> Harness {
        let db = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(db.path().to_str().unwrap(), "sql").unwrap();

        let aggregates: Arc<dyn AggregateStore> = Arc::new(store.clone());
        let verdicts: Arc<dyn VerdictStore> = Arc::new(store.clone());
        let worker = Arc::new(ApprovalWorker::new(
            aggregates.clone(),
            verdicts.clone(),
            RuleEngine::new(ScoreBands::default()),
            tokens.iter().map(|(a, s)| TrackedToken::new(a, s)).collect(),
            vec![WindowSize::Hour1],
        ));

        Harness {
            _db: db,
            store: store.clone(),
            api: ApprovalApi::new(worker, aggregates, verdicts),
        }
    }

    /// `count` transfers of `amount` inside hour `hour`, spread over
    /// `senders` × `receivers` distinct addresses.
    fn transfers(token: &str, hour: i64, count: u64, amount: u64, senders: u64, receivers: u64) -> Vec<TransferEvent> {
        (0..count)
            .map(|i| TransferEvent {
                chain: "ethereum".to_string(),
                token_address: token.to_string(),
                tx_hash: format!("0x{}{:04}{:06}", &token[2..], hour, i),
                log_index: i,
                block_number: (hour as u64) * 300 + i,
                block_timestamp: BASE + hour * HOUR + (i as i64) * 1_000,
                sender: format!("0xsender{}", i % senders),
                receiver: format!("0xreceiver{}", i % receivers),
                amount: U256::from(amount),
                direction: FlowDirection::In,
            })
            .collect()
    }

    async fn roll_up(h: &Harness, token: &str, through_hour: i64) -> usize {
        h.store
            .roll_up(token, WindowSize::Hour1, BASE + through_hour * HOUR, BASE + through_hour * HOUR)
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_three_window_gap_is_rejected() {
        // Test: Two windows with three silent hours between them
        let token = "0xaaaa";
        let h = harness(&[(token, "AAA")]);

        h.store.insert_transfer_events(&transfers(token, 0, 5, 100, 5, 5)).unwrap();
        h.store.insert_transfer_events(&transfers(token, 4, 6, 100, 6, 6)).unwrap();
        assert_eq!(roll_up(&h, token, 6).await, 2);

        let verdicts = h.api.run_for_token(token, None, WindowSize::Hour1).await.unwrap();
        assert_eq!(verdicts.len(), 2);

        // First window in a series is exempt
        assert_eq!(verdicts[0].status, VerdictStatus::Approved);
        assert_eq!(verdicts[0].score, 100);

        let gap = &verdicts[1];
        assert_eq!(gap.window_start, BASE + 4 * HOUR);
        assert_eq!(gap.hits.len(), 1);
        assert_eq!(gap.hits[0].rule, CONTINUITY);
        assert_eq!(gap.hits[0].penalty, 60);
        assert_eq!(gap.hits[0].reason, "gap of 3 windows, expected continuous sequence");
        assert_eq!(gap.score, 40);
        assert_eq!(gap.status, VerdictStatus::Rejected);

        // Approved facts hide the rejected window, the debug view shows it
        let approved = h.api.approved_facts(token, WindowSize::Hour1, 10).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].window.event_count, 5);

        let all = h.api.all_facts(token, WindowSize::Hour1, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].verdict.status, VerdictStatus::Rejected);
        assert_eq!(all[0].window.event_count, 6);
    }

    #[tokio::test]
    async fn test_replayed_ingestion_changes_nothing() {
        // Test: Re-inserting the same transfers and re-running every stage is a no-op
        let token = "0xbbbb";
        let h = harness(&[(token, "BBB")]);
        let events: Vec<TransferEvent> = (0..3).flat_map(|hour| transfers(token, hour, 4, 250, 2, 3)).collect();

        assert_eq!(h.store.insert_transfer_events(&events).unwrap(), 12);
        assert_eq!(roll_up(&h, token, 3).await, 3);
        assert_eq!(h.api.run_for_token(token, None, WindowSize::Hour1).await.unwrap().len(), 3);

        assert_eq!(h.store.insert_transfer_events(&events).unwrap(), 0);
        assert_eq!(roll_up(&h, token, 3).await, 0);
        assert!(h.api.run_for_token(token, None, WindowSize::Hour1).await.unwrap().is_empty());

        let windows = h.store.latest_windows(token, WindowSize::Hour1, 10).await.unwrap();
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| w.event_count == 4 && w.inflow_amount == U256::from(1_000u64)));

        let stats = h.api.stats().await.unwrap();
        assert_eq!(stats.counts.total(), 3);
    }

    #[tokio::test]
    async fn test_identical_consecutive_windows_quarantined() {
        // Test: Two hours with the exact same metric tuple
        let token = "0xcccc";
        let h = harness(&[(token, "CCC")]);

        h.store.insert_transfer_events(&transfers(token, 0, 100, 5_000, 10, 12)).unwrap();
        h.store.insert_transfer_events(&transfers(token, 1, 100, 5_000, 10, 12)).unwrap();
        roll_up(&h, token, 2).await;

        let verdicts = h.api.run_for_token(token, None, WindowSize::Hour1).await.unwrap();
        let second = &verdicts[1];
        assert_eq!(second.metrics_hash, verdicts[0].metrics_hash);
        assert_eq!(second.hits.len(), 1);
        assert_eq!(second.hits[0].rule, DUPLICATION);
        assert_eq!(second.hits[0].penalty, 35);
        assert_eq!(second.score, 65);
        assert_eq!(second.status, VerdictStatus::Quarantined);
    }

    #[tokio::test]
    async fn test_spike_without_new_actors_flagged() {
        // Test: 10 → 150 transfers while actors only go from 8 to 9
        let token = "0xdddd";
        let h = harness(&[(token, "DDD")]);

        h.store.insert_transfer_events(&transfers(token, 0, 10, 100, 4, 4)).unwrap();
        h.store.insert_transfer_events(&transfers(token, 1, 150, 100, 4, 5)).unwrap();
        roll_up(&h, token, 2).await;

        let verdicts = h.api.run_for_token(token, None, WindowSize::Hour1).await.unwrap();
        let spike = &verdicts[1];
        assert_eq!(spike.hits.len(), 1);
        assert_eq!(spike.hits[0].rule, ANOMALY_SPIKE);
        assert_eq!(spike.hits[0].penalty, 20);
        assert_eq!(spike.score, 80);
        assert_eq!(spike.status, VerdictStatus::Approved);
    }

    #[tokio::test]
    async fn test_scheduled_run_covers_every_tracked_token() {
        // Test: The worker driver evaluates all tracked tokens
        let h = harness(&[("0xeeee", "EEE"), ("0xffff", "FFF")]);
        for token in ["0xeeee", "0xffff"] {
            h.store.insert_transfer_events(&transfers(token, 0, 3, 10, 3, 3)).unwrap();
            roll_up(&h, token, 1).await;
        }

        assert!(h.api.start_worker(std::time::Duration::from_millis(20)).await);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(h.api.stop_worker().await);

        let stats = h.api.stats().await.unwrap();
        assert_eq!(stats.counts.approved, 2);
        assert_eq!(stats.approval_rate, 1.0);
        assert!(stats.worker.runs_completed >= 1);
        assert!(!stats.worker.running);
    }
}
