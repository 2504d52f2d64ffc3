mod common;
use common::{eeg_field_recording, rms, sine};
use meegprep::linalg::randn;
use meegprep::{find_bad_eeg, BadEegConfig, ChannelKind, Recording};
use rand::rngs::StdRng;
use rand::SeedableRng;

const SFREQ: f64 = 500.0;

/// Field recording with three faulty electrodes:
/// EEG005 amplified 20×, EEG020 replaced by noise, EEG030 with 70 Hz added.
fn faulty_recording() -> Recording {
    let mut rec = eeg_field_recording(16, SFREQ, 10.0, 0.02, 7);
    let n = rec.n_times();
    rec.data.row_mut(4).mapv_inplace(|v| 20.0 * v);
    let mut rng = StdRng::seed_from_u64(11);
    rec.data.row_mut(19).iter_mut().for_each(|v| *v = 0.6 * randn(&mut rng));
    let hum = sine(70.0, SFREQ, n);
    rec.data.row_mut(29).iter_mut().zip(&hum).for_each(|(v, h)| *v += 0.5 * h);
    rec
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ── Reference loop ────────────────────────────────────────────────────────────

#[test]
fn loop_finds_injected_channels_and_converges() {
    let mut rec = faulty_recording();
    let outcome = find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();

    let mut loop_bads = outcome.loop_bads.clone();
    loop_bads.sort();
    assert_eq!(loop_bads, names(&["EEG005", "EEG020", "EEG030"]));
    let mut true_bads = outcome.true_bads.clone();
    true_bads.sort();
    assert_eq!(true_bads, names(&["EEG005", "EEG020", "EEG030"]));

    assert!(outcome.converged);
    assert!(outcome.iterations >= 2, "the loop stops on the first iteration with nothing new");
    assert!(rec.info.bads.is_empty(), "interpolated channels leave the bad list");
}

#[test]
fn accumulated_bad_set_only_grows() {
    let mut rec = faulty_recording();
    let outcome = find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    assert!(!outcome.history.is_empty());
    for pair in outcome.history.windows(2) {
        assert!(pair[1].len() > pair[0].len());
        assert!(pair[0].iter().all(|b| pair[1].contains(b)));
    }
    assert_eq!(outcome.history.last().unwrap(), &outcome.loop_bads);
}

#[test]
fn second_pass_finds_nothing_new() {
    let mut rec = faulty_recording();
    find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    let again = find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    assert!(again.true_bads.is_empty(), "unexpected bads {:?}", again.true_bads);
    assert_eq!(again.iterations, 1);
}

#[test]
fn output_is_average_referenced_over_good_channels() {
    let mut rec = faulty_recording();
    let outcome = find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    // the average excludes the channels that were bad when it was taken
    let good: Vec<usize> = rec
        .picks(&[ChannelKind::Eeg], false)
        .into_iter()
        .filter(|&c| !outcome.true_bads.contains(&rec.info.channels[c].name))
        .collect();
    assert_eq!(good.len(), 29);
    for t in (0..rec.n_times()).step_by(97) {
        let s: f64 = good.iter().map(|&c| rec.data[[c, t]]).sum();
        approx::assert_abs_diff_eq!(s, 0.0, epsilon = 1e-9);
    }
}

#[test]
fn iteration_cap_stops_the_loop_unconverged() {
    let mut rec = faulty_recording();
    let cfg = BadEegConfig { max_iter: 1, ..BadEegConfig::default() };
    let outcome = find_bad_eeg(&mut rec, &cfg).unwrap();
    assert_eq!(outcome.iterations, 1);
    assert!(!outcome.converged);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history[0], outcome.loop_bads);
    assert!(!outcome.loop_bads.is_empty());
}

#[test]
fn amplified_channel_is_repaired() {
    let clean = eeg_field_recording(16, SFREQ, 10.0, 0.02, 7);
    let mut rec = faulty_recording();
    find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    let repaired = rms(&rec.data.row(4).to_vec());
    let expected = rms(&clean.data.row(4).to_vec());
    assert!((repaired / expected - 1.0).abs() < 0.2, "rms {repaired} vs {expected}");
}

#[test]
fn clean_recording_has_no_bads() {
    let mut rec = eeg_field_recording(16, SFREQ, 10.0, 0.02, 3);
    let outcome = find_bad_eeg(&mut rec, &BadEegConfig::default()).unwrap();
    assert!(outcome.loop_bads.is_empty());
    assert!(outcome.true_bads.is_empty());
    assert!(outcome.history.is_empty());
    assert_eq!(outcome.iterations, 1);
}

// ── Interpolation ─────────────────────────────────────────────────────────────

#[test]
fn interpolation_recovers_smooth_field() {
    let clean = eeg_field_recording(16, SFREQ, 2.0, 0.0, 1);
    let mut rec = clean.clone();
    rec.data.row_mut(8).fill(0.0);
    rec.data.row_mut(24).fill(0.0);
    rec.mark_bad(&["EEG009", "EEG025"]);
    rec.interpolate_bads(true).unwrap();

    assert!(rec.info.bads.is_empty());
    for c in [8, 24] {
        let err: Vec<f64> = rec.data.row(c).iter().zip(clean.data.row(c)).map(|(a, b)| a - b).collect();
        assert!(rms(&err) < 0.1 * rms(&clean.data.row(c).to_vec()), "channel {c}: rms error {}", rms(&err));
    }
    // good channels untouched
    assert_eq!(rec.data.row(0), clean.data.row(0));
}

#[test]
fn interpolation_keeps_bads_when_asked() {
    let mut rec = eeg_field_recording(16, SFREQ, 1.0, 0.0, 1);
    rec.mark_bad(&["EEG003"]);
    rec.interpolate_bads(false).unwrap();
    assert_eq!(rec.info.bads, vec!["EEG003"]);
}
