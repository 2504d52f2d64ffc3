/// Shared builders for synthetic recordings.
use std::f64::consts::PI;

use meegprep::linalg::randn;
use meegprep::{ChannelInfo, ChannelKind, Recording, RecordingInfo};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub const HEAD_CENTER: [f64; 3] = [0.0, 0.0, 0.04];
pub const HEAD_RADIUS: f64 = 0.09;

/// Unit direction at `elevation` / `azimuth` (degrees).
pub fn direction(elevation: f64, azimuth: f64) -> [f64; 3] {
    let (el, az) = (elevation.to_radians(), azimuth.to_radians());
    [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()]
}

/// EEG cap: two rings of `per_ring` electrodes at 20° and 40° elevation.
/// Returns the channels and their unit directions from the head centre.
#[allow(unused)]
pub fn eeg_cap(per_ring: usize) -> (Vec<ChannelInfo>, Vec<[f64; 3]>) {
    let mut channels = Vec::new();
    let mut dirs = Vec::new();
    for (ring, elev) in [20.0, 40.0].into_iter().enumerate() {
        for k in 0..per_ring {
            let offset = if ring == 1 { 180.0 / per_ring as f64 } else { 0.0 };
            let d = direction(elev, k as f64 * 360.0 / per_ring as f64 + offset);
            let mut loc = [0.0; 12];
            for i in 0..3 {
                loc[i] = HEAD_CENTER[i] + HEAD_RADIUS * d[i];
            }
            let name = format!("EEG{:03}", channels.len() + 1);
            channels.push(ChannelInfo::new(name, ChannelKind::Eeg).with_loc(loc));
            dirs.push(d);
        }
    }
    (channels, dirs)
}

#[allow(unused)]
pub fn sine(freq: f64, sfreq: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| (2.0 * PI * freq * i as f64 / sfreq).sin()).collect()
}

/// EEG recording of the field `x·sin(6 Hz) + y·sin(11 Hz)` plus white noise
/// of standard deviation `noise`.
#[allow(unused)]
pub fn eeg_field_recording(per_ring: usize, sfreq: f64, duration: f64, noise: f64, seed: u64) -> Recording {
    let (channels, dirs) = eeg_cap(per_ring);
    let n = (sfreq * duration) as usize;
    let s1 = sine(6.0, sfreq, n);
    let s2 = sine(11.0, sfreq, n);
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array2::from_shape_fn((channels.len(), n), |(c, t)| {
        dirs[c][0] * s1[t] + dirs[c][1] * s2[t] + noise * randn(&mut rng)
    });
    Recording::new(RecordingInfo::new(sfreq, channels), data).unwrap()
}

/// Single-channel recording of the given kind.
#[allow(unused)]
pub fn single_channel(name: &str, kind: ChannelKind, sfreq: f64, samples: Vec<f64>) -> Recording {
    let n = samples.len();
    let data = Array2::from_shape_vec((1, n), samples).unwrap();
    Recording::new(RecordingInfo::new(sfreq, vec![ChannelInfo::new(name, kind)]), data).unwrap()
}

#[allow(unused)]
pub fn rms(x: &[f64]) -> f64 {
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}
