mod common;
use common::{single_channel, sine};
use meegprep::resample::resample;
use meegprep::spectrum::welch;
use meegprep::ChannelKind;
use ndarray::Array2;

fn peak_frequency(data: &Array2<f64>, sfreq: f64) -> f64 {
    let (freqs, psd) = welch(data, sfreq, sfreq as usize).unwrap();
    let row = psd.row(0);
    let k = (0..row.len()).max_by(|&a, &b| row[a].total_cmp(&row[b])).unwrap();
    freqs[k]
}

#[test]
fn downsampling_keeps_length_ratio_and_frequency() {
    let x = Array2::from_shape_vec((1, 10_000), sine(12.0, 1000.0, 10_000)).unwrap();
    let y = resample(&x, 1000.0, 200.0).unwrap();
    assert_eq!(y.ncols(), 2000);
    approx::assert_abs_diff_eq!(peak_frequency(&y, 200.0), 12.0, epsilon = 0.5);
    // amplitude preserved away from the edges
    let peak = y.slice(ndarray::s![0, 200..1800]).iter().fold(0.0f64, |m, v| m.max(v.abs()));
    approx::assert_abs_diff_eq!(peak, 1.0, epsilon = 0.02);
}

#[test]
fn upsampling_matches_the_analytic_signal() {
    let x = Array2::from_shape_vec((1, 2000), sine(5.0, 200.0, 2000)).unwrap();
    let y = resample(&x, 200.0, 500.0).unwrap();
    assert_eq!(y.ncols(), 5000);
    let truth = sine(5.0, 500.0, 5000);
    for t in (1000..4000).step_by(37) {
        approx::assert_abs_diff_eq!(y[[0, t]], truth[t], epsilon = 1e-2);
    }
}

#[test]
fn recording_resample_updates_sfreq_and_first_samp() {
    let mut rec = single_channel("EEG001", ChannelKind::Eeg, 1000.0, sine(8.0, 1000.0, 5000));
    rec.info.first_samp = 25_000;
    rec.info.annotations.push(1.5, 0.5, "BAD_muscle");
    let out = rec.resampled(250.0).unwrap();
    assert_eq!(out.sfreq(), 250.0);
    assert_eq!(out.n_times(), 1250);
    assert_eq!(out.info.first_samp, 6250);
    assert_eq!(out.info.annotations, rec.info.annotations);
    approx::assert_abs_diff_eq!(out.duration(), rec.duration(), epsilon = 1e-9);
}
