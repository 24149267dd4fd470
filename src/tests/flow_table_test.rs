#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::export::ExportRecord;
    use crate::feature::types::FeatureValue;
    use crate::flow_table::FlowTable;
    use crate::metrics::ShardStats;
    use crate::packet::{ACK_FLAG, FIN_FLAG, RST_FLAG, SYN_FLAG};
    use crate::tests::support::{compile, packet, run_table, tcp_packet, SECOND};

    const REASON_IDLE: u64 = 1;
    const REASON_ACTIVE: u64 = 2;
    const REASON_END: u64 = 3;

    fn table_with_spec(
        spec_json: &str,
        active_seconds: i64,
        idle_seconds: i64,
    ) -> (FlowTable, mpsc::Receiver<ExportRecord>) {
        let (tx, rx) = mpsc::channel(10_000);
        let table = FlowTable::new(
            Arc::new(compile(spec_json)),
            active_seconds * SECOND,
            idle_seconds * SECOND,
            Arc::new(ShardStats::default()),
            tx,
        );
        (table, rx)
    }

    /// One flow of three packets, emitted by the idle sweep of a later
    /// packet on another key.
    #[tokio::test]
    async fn idle_timeout_emits_the_flow() {
        let (mut table, mut rx) = table_with_spec(
            r#"["sourceIPv4Address", "destinationIPv4Address", "packetTotalCount",
                {"apply": ["mean", "octetTotalCount"]}, "flowEndReason"]"#,
            1800,
            300,
        );
        for (t, size) in [(0, 40u16), (1, 1500), (2, 40)] {
            let p = packet("10.0.0.1", 1000, "10.0.0.2", 80, 6, t * SECOND, size);
            table.process_packet(&p).await.unwrap();
        }
        // different key, far enough in the future to pass the idle deadline
        let other = packet("10.0.0.3", 1000, "10.0.0.2", 80, 6, 303 * SECOND, 40);
        table.process_packet(&other).await.unwrap();

        let record = rx.try_recv().expect("idle flow must be emitted");
        assert_eq!(
            record.values[0],
            Some(FeatureValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(
            record.values[1],
            Some(FeatureValue::Ipv4(Ipv4Addr::new(10, 0, 0, 2)))
        );
        assert_eq!(record.values[2], Some(FeatureValue::Unsigned(3)));
        let Some(FeatureValue::Float(mean)) = &record.values[3] else {
            panic!("mean must be a float");
        };
        assert!((mean - 1580.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.values[4], Some(FeatureValue::Unsigned(REASON_IDLE)));
        // last_time + idle_timeout <= emission time
        assert!(2 * SECOND + 300 * SECOND <= record.when);
        assert_eq!(table.len(), 1);
    }

    /// The active timeout splits a long-running flow in two.
    #[tokio::test]
    async fn active_timeout_splits_a_long_flow() {
        let (mut table, mut rx) =
            table_with_spec(r#"["packetTotalCount", "flowEndReason"]"#, 1800, 300);
        for t in 0..2000i64 {
            let p = packet("10.0.0.1", 1000, "10.0.0.2", 80, 6, t * SECOND, 100);
            table.process_packet(&p).await.unwrap();
        }
        table.finish(1999 * SECOND).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.values[0], Some(FeatureValue::Unsigned(1800)));
        assert_eq!(first.values[1], Some(FeatureValue::Unsigned(REASON_ACTIVE)));
        assert!(1800 * SECOND <= first.when);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.values[0], Some(FeatureValue::Unsigned(200)));
        assert_eq!(second.values[1], Some(FeatureValue::Unsigned(REASON_END)));

        assert!(rx.try_recv().is_err(), "exactly two records expected");
    }

    /// Both directions map onto one flow; direction bits differ.
    #[tokio::test]
    async fn bidirectional_packets_share_a_flow() {
        let a = packet("1.1.1.1", 5, "2.2.2.2", 6, 6, 0, 40);
        let b = packet("2.2.2.2", 6, "1.1.1.1", 5, 6, SECOND, 40);
        assert_eq!(a.key, b.key);
        assert!(a.forward != b.forward);

        let (mut table, mut rx) = table_with_spec(r#"["packetTotalCount"]"#, 1800, 300);
        table.process_packet(&a).await.unwrap();
        table.process_packet(&b).await.unwrap();
        table.finish(SECOND).await.unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.values[0], Some(FeatureValue::Unsigned(2)));
        assert!(rx.try_recv().is_err());
    }

    /// A graceful FIN exchange ends the flow without waiting for a
    /// timeout.
    #[tokio::test]
    async fn fin_exchange_terminates_early() {
        let (mut table, mut rx) =
            table_with_spec(r#"["packetTotalCount", "flowEndReason"]"#, 1800, 300);
        let fin_fwd = tcp_packet("1.1.1.1", 5, "2.2.2.2", 6, 0, 40, FIN_FLAG, 100, 0);
        let fin_bwd = tcp_packet(
            "2.2.2.2",
            6,
            "1.1.1.1",
            5,
            SECOND,
            40,
            FIN_FLAG | ACK_FLAG,
            200,
            101,
        );
        let ack_fwd = tcp_packet("1.1.1.1", 5, "2.2.2.2", 6, 2 * SECOND, 40, ACK_FLAG, 101, 201);
        table.process_packet(&fin_fwd).await.unwrap();
        table.process_packet(&fin_bwd).await.unwrap();
        table.process_packet(&ack_fwd).await.unwrap();

        let record = rx.try_recv().expect("flow must close on the final ack");
        assert_eq!(record.values[0], Some(FeatureValue::Unsigned(3)));
        assert_eq!(record.values[1], Some(FeatureValue::Unsigned(REASON_END)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reset_terminates_immediately() {
        let (mut table, mut rx) =
            table_with_spec(r#"["packetTotalCount", "flowEndReason"]"#, 1800, 300);
        let syn = tcp_packet("1.1.1.1", 5, "2.2.2.2", 6, 0, 40, SYN_FLAG, 1, 0);
        let rst = tcp_packet("2.2.2.2", 6, "1.1.1.1", 5, SECOND, 40, RST_FLAG, 2, 2);
        table.process_packet(&syn).await.unwrap();
        table.process_packet(&rst).await.unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.values[0], Some(FeatureValue::Unsigned(2)));
        assert_eq!(record.values[1], Some(FeatureValue::Unsigned(REASON_END)));
    }

    /// A flow whose idle deadline passed before eof still reports its
    /// timeout reason; only genuinely live flows end with EndOfFlow.
    #[tokio::test]
    async fn finish_expires_overdue_flows_first() {
        let (mut table, mut rx) =
            table_with_spec(r#"["packetTotalCount", "flowEndReason"]"#, 1800, 300);
        let old = packet("10.0.0.1", 1000, "10.0.0.2", 80, 6, 0, 40);
        let young = packet("10.0.0.3", 1000, "10.0.0.2", 80, 6, 301 * SECOND, 40);
        table.process_packet(&old).await.unwrap();
        table.process_packet(&young).await.unwrap();
        table.finish(302 * SECOND).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.values[1], Some(FeatureValue::Unsigned(REASON_IDLE)));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.values[1], Some(FeatureValue::Unsigned(REASON_END)));
    }

    /// An empty capture produces no records and finishes the exporter
    /// exactly once.
    #[tokio::test]
    async fn empty_capture_still_finishes() {
        let (records, _metrics, collector) =
            run_table(4, r#"["packetTotalCount"]"#, 1800, 300, Vec::new()).await;
        assert!(records.is_empty());
        assert_eq!(
            collector
                .finishes
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn stopped_flows_leave_no_state_behind() {
        let (mut table, mut rx) = table_with_spec(r#"["packetTotalCount"]"#, 1800, 300);
        let p = packet("10.0.0.1", 1000, "10.0.0.2", 80, 6, 0, 40);
        table.process_packet(&p).await.unwrap();
        table.finish(SECOND).await.unwrap();
        assert!(table.is_empty());
        rx.try_recv().unwrap();

        // the same key afterwards creates a fresh flow
        let later = packet("10.0.0.1", 1000, "10.0.0.2", 80, 6, 2 * SECOND, 40);
        table.process_packet(&later).await.unwrap();
        table.finish(3 * SECOND).await.unwrap();
        let record = rx.try_recv().unwrap();
        assert_eq!(record.values[0], Some(FeatureValue::Unsigned(1)));
    }

    // direction-carrying packet helper sanity
    #[test]
    fn canonical_key_orders_endpoints() {
        let p = packet("9.9.9.9", 999, "1.1.1.1", 1, 17, 0, 40);
        assert!(!p.forward);
        assert_eq!(format!("{}", p.key), "1.1.1.1:1-9.9.9.9:999-17");
    }
}
