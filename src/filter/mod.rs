//! FIR filter design and application.
//!
//! - [`design`]: Hamming-windowed sinc highpass, lowpass, band-pass and notch
//!   design, matching `mne.filter.create_filter(fir_window='hamming', phase='zero')`.
//! - [`apply`]: Overlap-add zero-phase convolution, matching MNE's
//!   `_overlap_add_filter` / `_1d_overlap_filter`.

pub mod apply;
pub mod design;

pub use apply::{apply_fir_rows, apply_fir_zero_phase, filter_1d};
pub use design::{
    auto_filter_length, auto_trans_bandwidth, auto_trans_bandwidth_high, design, design_bandpass,
    design_highpass, design_lowpass, design_notch, firwin, gain_at, hamming,
};

use anyhow::Result;
use log::debug;

use crate::recording::{ChannelKind, Recording};

impl Recording {
    /// Zero-phase FIR filter of every channel whose kind is in `kinds`
    /// (bad channels included, as MNE does).
    pub fn filter(&mut self, l_freq: Option<f64>, h_freq: Option<f64>, kinds: &[ChannelKind]) -> Result<()> {
        let Some(h) = design::design(l_freq, h_freq, self.sfreq())? else {
            return Ok(());
        };
        let rows = self.picks(kinds, false);
        debug!("filtering {} channels ({l_freq:?}, {h_freq:?}) Hz with {} taps", rows.len(), h.len());
        apply::apply_fir_rows(&mut self.data, &rows, &h)
    }

    /// Remove line noise at each of `freqs` from channels of the given kinds.
    pub fn notch_filter(&mut self, freqs: &[f64], kinds: &[ChannelKind]) -> Result<()> {
        if freqs.is_empty() {
            return Ok(());
        }
        let h = design::design_notch(freqs, self.sfreq())?;
        let rows = self.picks(kinds, false);
        debug!("notch filtering {} channels at {freqs:?} Hz", rows.len());
        apply::apply_fir_rows(&mut self.data, &rows, &h)
    }
}
