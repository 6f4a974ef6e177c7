//! Keyed aggregation through the full pipeline: `by_request` and
//! `by_timer` reports fed over real UDP.

mod common;

use std::time::Duration;

use common::{client_socket, record, send_record, start_engine, wait_for};
use pinba_engine::proto::WireRequest;
use pinba_engine::report::{ByRequestConfig, ByTimerConfig, KeyPart, ReportConfig, RequestField};
use pinba_engine::{MergeFlags, SnapshotData};

#[test]
fn test_by_request_keyed_on_script() {
    let engine = start_engine();
    engine
        .add_report(ReportConfig::ByRequest(ByRequestConfig {
            name: "by_script".to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 50,
            histogram: None,
            filters: Vec::new(),
            keys: vec![KeyPart::RequestField(RequestField::Script)],
        }))
        .expect("add");

    let addr = engine.listen_addr();
    let sock = client_socket();

    send_record(&sock, addr, &record("/seven.php", 0.010));
    send_record(&sock, addr, &record("/seven.php", 0.010));
    send_record(&sock, addr, &record("/eight.php", 0.010));

    wait_for(Duration::from_secs(5), || {
        let mut snap = engine.get_report_snapshot("by_script").expect("snapshot");
        snap.prepare(MergeFlags::NONE);
        if snap.row_count() != 2 {
            return None;
        }

        let mut seven = 0u32;
        let mut eight = 0u32;
        for row in snap.rows() {
            let SnapshotData::ByRequest(d) = row.data else {
                panic!("wrong data kind")
            };
            let key_words = snap.key_str(&row.key);
            match key_words[0].as_ref() {
                "/seven.php" => {
                    seven = d.req_count;
                    let ms = d.time_total.as_millis();
                    assert!((19..=21).contains(&ms), "time_total = {ms}ms");
                }
                "/eight.php" => {
                    eight = d.req_count;
                    let ms = d.time_total.as_millis();
                    assert!((9..=11).contains(&ms), "time_total = {ms}ms");
                }
                other => panic!("unexpected key {other}"),
            }
        }
        (seven == 2 && eight == 1).then_some(())
    });
}

fn timer_record(group_value: &str, extra_timer: bool) -> WireRequest {
    let mut r = record("/t.php", 0.020);
    r.dictionary = vec!["group".to_string(), group_value.to_string(), "other".to_string()];
    // timer 0 carries group=<value>
    r.timer_value = vec![0.005];
    r.timer_hit_count = vec![3];
    r.timer_tag_count = vec![1];
    r.timer_tag_name = vec![0];
    r.timer_tag_value = vec![1];
    if extra_timer {
        // timer 1 carries only other=<value>: must be bloom-rejected
        r.timer_value.push(0.007);
        r.timer_hit_count.push(5);
        r.timer_tag_count.push(1);
        r.timer_tag_name.push(2);
        r.timer_tag_value.push(1);
    }
    r
}

#[test]
fn test_by_timer_bloom_and_grouping() {
    let engine = start_engine();

    let group = engine.dictionary().add_nameword("group");
    engine
        .add_report(ReportConfig::ByTimer(ByTimerConfig {
            name: "by_group".to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 50,
            histogram: None,
            filters: Vec::new(),
            timer_filters: Vec::new(),
            keys: vec![KeyPart::TimerTag(group.id)],
        }))
        .expect("add");

    let addr = engine.listen_addr();
    let sock = client_socket();

    send_record(&sock, addr, &timer_record("g1", true));

    wait_for(Duration::from_secs(5), || {
        let mut snap = engine.get_report_snapshot("by_group").expect("snapshot");
        snap.prepare(MergeFlags::NONE);
        if snap.row_count() != 1 {
            return None;
        }

        let row = snap.rows().next().expect("row");
        assert_eq!(snap.key_str(&row.key)[0].as_ref(), "g1");
        let SnapshotData::ByTimer(d) = row.data else {
            panic!("wrong data kind")
        };
        assert_eq!(d.req_count, 1);
        assert_eq!(d.hit_count, 3, "the untagged timer was rejected");
        Some(())
    });

    let state = engine.get_report_state("by_group").expect("state");
    assert_eq!(state.stats.timers_scanned, 2);
    assert_eq!(state.stats.timers_skipped_by_bloom, 1);
    assert_eq!(state.stats.timers_aggregated, 1);
}

#[test]
fn test_by_timer_groups_across_packets() {
    let engine = start_engine();

    let group = engine.dictionary().add_nameword("group");
    engine
        .add_report(ReportConfig::ByTimer(ByTimerConfig {
            name: "by_group".to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 50,
            histogram: None,
            filters: Vec::new(),
            timer_filters: Vec::new(),
            keys: vec![KeyPart::TimerTag(group.id)],
        }))
        .expect("add");

    let addr = engine.listen_addr();
    let sock = client_socket();

    send_record(&sock, addr, &timer_record("g1", false));
    send_record(&sock, addr, &timer_record("g1", false));
    send_record(&sock, addr, &timer_record("g2", false));

    wait_for(Duration::from_secs(5), || {
        let mut snap = engine.get_report_snapshot("by_group").expect("snapshot");
        snap.prepare(MergeFlags {
            with_histograms: false,
            with_totals: true,
        });
        if snap.row_count() != 2 {
            return None;
        }

        let mut g1_reqs = 0u32;
        for row in snap.rows() {
            let SnapshotData::ByTimer(d) = row.data else {
                panic!("wrong data kind")
            };
            if snap.key_str(&row.key)[0].as_ref() == "g1" {
                g1_reqs = d.req_count;
                assert_eq!(d.hit_count, 6);
            } else {
                assert_eq!(d.hit_count, 3);
            }
        }
        if g1_reqs != 2 {
            return None;
        }

        let totals = snap.totals().expect("with_totals");
        let SnapshotData::ByTimer(t) = totals.data else {
            panic!("wrong data kind")
        };
        assert_eq!(t.hit_count, 9);
        Some(())
    });
}
