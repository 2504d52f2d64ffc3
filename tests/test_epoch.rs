use std::collections::BTreeMap;

use meegprep::events::{read_events, shift_events, write_events};
use meegprep::{ChannelInfo, ChannelKind, EpochParams, Epochs, Event, MetadataTable, Recording, RecordingInfo};
use ndarray::Array2;

/// 10 s run at 100 Hz whose magnetometer holds `level` everywhere.
fn run(first_samp: i64, level: f64) -> Recording {
    let channels = vec![ChannelInfo::new("MEG0111", ChannelKind::Mag), ChannelInfo::new("STI101", ChannelKind::Stim)];
    let data = Array2::from_shape_fn((2, 1000), |(c, _)| if c == 0 { level } else { 0.0 });
    let mut info = RecordingInfo::new(100.0, channels);
    info.first_samp = first_samp;
    Recording::new(info, data).unwrap()
}

fn ev(sample: i64, code: i32) -> Event {
    Event { sample, prev: 0, code }
}

fn params(reject_by_annotation: bool) -> EpochParams {
    EpochParams {
        tmin: -0.1,
        tmax: 0.2,
        reject: vec![(ChannelKind::Mag, 4e-12)],
        reject_by_annotation,
        picks: vec![ChannelKind::Mag],
    }
}

fn event_id() -> BTreeMap<String, i32> {
    BTreeMap::from([("face1".to_string(), 1), ("object1".to_string(), 21)])
}

fn meta(rows: &[&str]) -> MetadataTable {
    MetadataTable { columns: vec!["Category".into()], rows: rows.iter().map(|r| vec![r.to_string()]).collect() }
}

/// Two runs joined the way the epoching stage does it.
fn joined() -> (Recording, Vec<Event>, MetadataTable) {
    let runs = [run(1000, 1e-13), run(3000, 2e-13)];
    let events = [
        // 97 is not an epoching code
        vec![ev(1200, 1), ev(1250, 97), ev(1990, 21)],
        vec![ev(3300, 1)],
    ];
    let (raw, offsets) = Recording::concatenate(&runs).unwrap();
    let all: Vec<Event> = events.iter().zip(&offsets).flat_map(|(e, &off)| shift_events(e, off)).collect();
    let metadata = MetadataTable::concat(&[meta(&["face", "object"]), meta(&["face"])]).unwrap();
    (raw, all, metadata)
}

#[test]
fn events_of_later_runs_land_in_their_run() {
    let (raw, events, metadata) = joined();
    assert_eq!(events.iter().map(|e| e.sample).collect::<Vec<_>>(), vec![1200, 1250, 1990, 2300]);
    let ep = Epochs::new(&raw, &events, &event_id(), &params(false), Some(metadata)).unwrap();
    assert_eq!(ep.len(), 3);
    // third epoch comes from the second run
    approx::assert_abs_diff_eq!(ep.data[[2, 0, 0]], 2e-13, epsilon = 1e-25);
    approx::assert_abs_diff_eq!(ep.data[[0, 0, 30]], 1e-13, epsilon = 1e-25);
}

#[test]
fn run_boundary_rejects_straddling_epochs() {
    let (raw, events, metadata) = joined();
    let ep = Epochs::new(&raw, &events, &event_id(), &params(true), Some(metadata)).unwrap();
    assert_eq!(ep.len(), 2);
    assert_eq!(ep.drop_log, vec![vec![], vec!["BAD boundary".to_string()], vec![]]);
    let meta = ep.metadata.as_ref().unwrap();
    assert_eq!(meta.column("Category").unwrap(), vec!["face", "face"]);
    assert_eq!(ep.select_condition("Category", "face").unwrap().len(), 2);
    assert!(ep.select_condition("Category", "object").unwrap().is_empty());
    approx::assert_abs_diff_eq!(ep.drop_percentage(), 100.0 / 3.0, epsilon = 1e-9);
}

#[test]
fn files_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (raw, events, metadata) = joined();

    let eve = dir.path().join("run-eve.txt");
    write_events(&eve, &events).unwrap();
    assert_eq!(read_events(&eve).unwrap(), events);

    let csv = dir.path().join("meta.csv");
    metadata.write_csv(&csv).unwrap();
    let metadata = MetadataTable::read_csv(&csv).unwrap();

    let ep = Epochs::new(&raw, &events, &event_id(), &params(true), Some(metadata)).unwrap();
    let counts = dir.path().join("epo.csv");
    ep.write_counts(&counts).unwrap();
    assert_eq!(std::fs::read_to_string(&counts).unwrap(), "face1,object1\n2,0\n");

    let path = dir.path().join("epo.safetensors");
    ep.save(&path).unwrap();
    let back = Epochs::load(&path).unwrap();
    assert_eq!(back.data, ep.data);
    assert_eq!(back.events, ep.events);
    assert_eq!(back.drop_log, ep.drop_log);
    assert_eq!(back.metadata, ep.metadata);
}
