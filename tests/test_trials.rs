use meegprep::trials::{decode_exp1, Category, Duration, Exp1Trial, TaskRelevance};
use meegprep::{decode_trials, DecodeError, Event, Experiment, MetadataTable};

fn ev(list: &[(i64, i32)]) -> Vec<Event> {
    list.iter().map(|&(sample, code)| Event { sample, prev: 0, code }).collect()
}

/// Three trials at 500 Hz; the second one has a response 0.6 s after onset.
fn run_events() -> Vec<Event> {
    ev(&[
        (1000, 1),
        (1010, 101),
        (1020, 151),
        (1030, 201),
        (1040, 111),
        (2000, 97),
        (3000, 42),
        (3010, 102),
        (3020, 152),
        (3030, 202),
        (3040, 112),
        (3300, 255),
        (4000, 97),
        (5000, 80),
        (5010, 103),
        (5020, 153),
        (5030, 203),
        (5040, 113),
        (6000, 97),
    ])
}

#[test]
fn run_decodes_one_row_per_stimulus() {
    let rows = decode_exp1(&run_events(), 500.0).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows.iter().map(|r| r.category).collect::<Vec<_>>(),
        vec![Category::Face, Category::Letter, Category::FalseFont]
    );
    assert_eq!(rows[2].duration, Duration::Ms1500);
    assert_eq!(rows[1].task_relevance, TaskRelevance::RelevantNonTarget);
    assert!(rows[1].response);
    approx::assert_abs_diff_eq!(rows[1].response_time.unwrap(), 0.6, epsilon = 1e-12);
    assert_eq!(rows[0].response_time, None);
}

#[test]
fn metadata_csv_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-meta.csv");
    let table = decode_trials(Experiment::Exp1, &run_events(), 500.0).unwrap();
    table.write_csv(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "Stim_trigger,Category,Orientation,Duration,Task_relevance,Trial_ID,Response,Response_time(s)"
    );
    assert_eq!(lines.next().unwrap(), "1,face,Center,500ms,Relevant target,111,False,");
    assert_eq!(lines.next().unwrap(), "42,letter,Left,1000ms,Relevant non-target,112,True,0.6");

    let back = MetadataTable::read_csv(&path).unwrap();
    assert_eq!(back, table);
    let typed: Vec<Exp1Trial> = back.to_rows().unwrap();
    assert_eq!(typed, decode_exp1(&run_events(), 500.0).unwrap());
}

#[test]
fn dropped_terminator_is_reported_with_its_trial() {
    let mut events = run_events();
    events.retain(|e| !(e.sample == 4000 && e.code == 97));
    let err = decode_trials(Experiment::Exp1, &events, 500.0).unwrap_err();
    match err.downcast_ref::<DecodeError>() {
        Some(DecodeError::MissingTerminator { sample, code, .. }) => {
            assert_eq!((*sample, *code), (3000, 42));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
