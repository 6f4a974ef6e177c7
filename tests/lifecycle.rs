//! Engine lifecycle: report add/delete, clean shutdown, and dictionary
//! word reclamation once no consumer references remain.

mod common;

use std::time::Duration;

use common::{client_socket, record, send_record, start_engine, wait_for};
use pinba_engine::report::{ByRequestConfig, KeyPart, ReportConfig, RequestField};
use pinba_engine::PinbaError;

fn by_script_config(name: &str) -> ReportConfig {
    ReportConfig::ByRequest(ByRequestConfig {
        name: name.to_string(),
        time_window: Duration::from_secs(1),
        tick_count: 2,
        histogram: None,
        filters: Vec::new(),
        keys: vec![KeyPart::RequestField(RequestField::Script)],
    })
}

#[test]
fn test_duplicate_and_unknown_report_errors() {
    let engine = start_engine();

    engine.add_report(by_script_config("r")).expect("add");
    assert!(matches!(
        engine.add_report(by_script_config("r")),
        Err(PinbaError::DuplicateReport(_))
    ));
    assert!(matches!(
        engine.get_report_snapshot("missing"),
        Err(PinbaError::UnknownReport(_))
    ));
    assert!(matches!(
        engine.delete_report("missing"),
        Err(PinbaError::UnknownReport(_))
    ));

    engine.delete_report("r").expect("delete");
    engine.add_report(by_script_config("r")).expect("re-add after delete");
}

#[test]
fn test_shutdown_joins_cleanly_with_traffic_in_flight() {
    let mut engine = start_engine();
    engine.add_report(by_script_config("r")).expect("add");

    let addr = engine.listen_addr();
    let sock = client_socket();
    for _ in 0..50 {
        send_record(&sock, addr, &record("/x.php", 0.001));
    }

    // shutdown while batches may still be half-built; they are dropped
    // by design and everything joins
    engine.shutdown();
    engine.shutdown();
}

#[test]
fn test_words_are_reclaimed_after_all_consumers_drop() {
    let engine = start_engine();
    engine.add_report(by_script_config("r")).expect("add");

    let baseline = engine.dictionary().len();

    let addr = engine.listen_addr();
    let sock = client_socket();
    send_record(&sock, addr, &record("/unique-reclaim-probe.php", 0.001));

    // the wire words land in the dictionary
    wait_for(Duration::from_secs(5), || {
        (engine.dictionary().len() > baseline).then_some(())
    });
    let state = wait_for(Duration::from_secs(5), || {
        let state = engine.get_report_state("r").ok()?;
        (state.stats.packets_aggregated == 1).then_some(state)
    });
    assert_eq!(state.stats.packets_recv_total, 1);

    // drop every downstream holder: the report's ticks go away with the
    // report, and the repacker reaps its sealed word-slices on its
    // 1-second housekeeping tick
    engine.delete_report("r").expect("delete");

    wait_for(Duration::from_secs(10), || {
        (engine.dictionary().len() <= baseline).then_some(())
    });

    // re-interning resolves correctly whether or not ids got reused
    let id = engine.dictionary().get_or_add("/unique-reclaim-probe.php");
    assert_eq!(
        engine.dictionary().get_word(id).as_deref(),
        Some("/unique-reclaim-probe.php")
    );
}
