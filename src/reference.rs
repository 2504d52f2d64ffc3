//! EEG referencing.
//!
//! `average_reference_inplace` matches
//! `raw.set_eeg_reference('average', projection=False)` on a bare `[C, T]`
//! block: `data[c, t] -= mean(data[:, t])`.
//!
//! The per-sample median and mean reference signals are what the bad-EEG
//! loop iterates on.
use anyhow::Result;
use ndarray::{Array1, Array2, Axis};

use crate::error::PipelineError;
use crate::recording::{ChannelKind, Recording};
use crate::normalize::median;

pub fn average_reference_inplace(data: &mut Array2<f64>) {
    let means = mean_reference(data);
    subtract_reference(data, &means);
}

/// Per-sample mean across channels, shape `[T]`.
pub fn mean_reference(data: &Array2<f64>) -> Array1<f64> {
    data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()))
}

/// Per-sample median across channels, shape `[T]`.
pub fn median_reference(data: &Array2<f64>) -> Array1<f64> {
    let mut col = vec![0.0; data.nrows()];
    Array1::from_iter(data.columns().into_iter().map(|c| {
        col.iter_mut().zip(c.iter()).for_each(|(d, &v)| *d = v);
        median(&mut col)
    }))
}

/// `data[c, t] -= reference[t]` for every channel.
pub fn subtract_reference(data: &mut Array2<f64>, reference: &Array1<f64>) {
    for mut row in data.rows_mut() {
        row -= reference;
    }
}

impl Recording {
    /// Average reference over the good EEG channels, applied to every EEG
    /// channel (bads included). Returns the reference signal.
    pub fn set_eeg_reference_average(&mut self) -> Result<Array1<f64>> {
        let good = self.picks(&[ChannelKind::Eeg], true);
        if good.is_empty() {
            return Err(PipelineError::NoChannels("eeg").into());
        }
        let reference = mean_reference(&self.data.select(Axis(0), &good));
        for idx in self.picks(&[ChannelKind::Eeg], false) {
            let mut row = self.data.row_mut(idx);
            row -= &reference;
        }
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ChannelInfo, RecordingInfo};

    #[test]
    fn channel_sum_is_zero_after_reference() {
        let mut data = Array2::from_shape_fn((8, 512), |(c, t)| ((c * 7 + t * 3) as f64).sin());
        average_reference_inplace(&mut data);
        for &s in data.sum_axis(Axis(0)).iter() {
            approx::assert_abs_diff_eq!(s, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn reference_preserves_channel_differences() {
        let mut data = Array2::from_shape_fn((2, 10), |(c, _)| if c == 0 { 2.0 } else { 4.0 });
        average_reference_inplace(&mut data);
        for t in 0..10 {
            approx::assert_abs_diff_eq!(data[[0, t]] - data[[1, t]], -2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn median_ignores_single_outlier() {
        let data = Array2::from_shape_fn((5, 3), |(c, _)| if c == 4 { 1e6 } else { c as f64 });
        let m = median_reference(&data);
        assert_eq!(m.to_vec(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn recording_reference_skips_bads_and_non_eeg() {
        let channels = vec![
            ChannelInfo::new("EEG001", ChannelKind::Eeg),
            ChannelInfo::new("EEG002", ChannelKind::Eeg),
            ChannelInfo::new("EEG003", ChannelKind::Eeg),
            ChannelInfo::new("EOG001", ChannelKind::Eog),
        ];
        let data = Array2::from_shape_fn((4, 4), |(c, _)| [1.0, 3.0, 100.0, 7.0][c]);
        let mut rec = Recording::new(RecordingInfo::new(100.0, channels), data).unwrap();
        rec.mark_bad(&["EEG003"]);
        let r = rec.set_eeg_reference_average().unwrap();
        assert_eq!(r[0], 2.0);
        assert_eq!(rec.data[[0, 0]], -1.0);
        assert_eq!(rec.data[[2, 0]], 98.0);
        assert_eq!(rec.data[[3, 0]], 7.0);
    }
}
