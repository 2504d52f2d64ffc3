//! Time-span annotations attached to a recording (blinks, muscle bursts,
//! run boundaries).
//!
//! Onsets are in seconds relative to the first sample of the recording.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

/// An ordered list of [`Annotation`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, onset: f64, duration: f64, description: impl Into<String>) {
        self.0.push(Annotation { onset, duration, description: description.into() });
    }

    /// Append every annotation of `other`, keeping onset order.
    pub fn extend(&mut self, other: &Annotations) {
        self.0.extend(other.0.iter().cloned());
        self.sort();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.0.iter()
    }

    /// Number of annotations whose description equals `description`.
    pub fn count(&self, description: &str) -> usize {
        self.0.iter().filter(|a| a.description == description).count()
    }

    /// Per-sample mask of the spans covered by `BAD…` annotations.
    pub fn bad_mask(&self, n_times: usize, sfreq: f64) -> Vec<bool> {
        let mut mask = vec![false; n_times];
        for a in self.0.iter().filter(|a| is_bad(&a.description)) {
            let start = ((a.onset * sfreq).round().max(0.0) as usize).min(n_times);
            let stop = (((a.onset + a.duration) * sfreq).round().max(0.0) as usize).min(n_times);
            mask[start..stop.max(start)].iter_mut().for_each(|m| *m = true);
        }
        mask
    }

    /// Description of the first `BAD…` annotation touching `[tmin, tmax]`
    /// (seconds, inclusive). Zero-length annotations inside the span count.
    pub fn first_bad_overlap(&self, tmin: f64, tmax: f64) -> Option<&str> {
        self.0
            .iter()
            .filter(|a| is_bad(&a.description))
            .find(|a| a.onset <= tmax && a.onset + a.duration >= tmin)
            .map(|a| a.description.as_str())
    }

    /// Copy with every onset moved by `offset` seconds.
    pub fn shifted(&self, offset: f64) -> Annotations {
        Annotations(
            self.0
                .iter()
                .map(|a| Annotation { onset: a.onset + offset, ..a.clone() })
                .collect(),
        )
    }

    fn sort(&mut self) {
        self.0.sort_by(|a, b| a.onset.total_cmp(&b.onset));
    }

    /// Build annotations from a per-sample boolean mask.
    ///
    /// Each run of `true` samples becomes one annotation. Runs of `false`
    /// shorter than `min_length_good` seconds that sit between two bad runs
    /// are absorbed into the surrounding bad span.
    pub fn from_mask(
        mask: &[bool],
        sfreq: f64,
        min_length_good: f64,
        description: &str,
    ) -> Annotations {
        let mut mask = mask.to_vec();
        let min_good = (min_length_good * sfreq).round() as usize;
        if min_good > 0 {
            fill_short_gaps(&mut mask, min_good);
        }

        let mut out = Annotations::new();
        let mut start: Option<usize> = None;
        for (i, &bad) in mask.iter().enumerate() {
            match (bad, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    out.push(s as f64 / sfreq, (i - s) as f64 / sfreq, description);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            out.push(s as f64 / sfreq, (mask.len() - s) as f64 / sfreq, description);
        }
        out
    }
}

fn is_bad(description: &str) -> bool {
    description.to_ascii_lowercase().starts_with("bad")
}

/// Set interior `false` runs shorter than `min_len` to `true`.
fn fill_short_gaps(mask: &mut [bool], min_len: usize) {
    let n = mask.len();
    let mut i = 0;
    while i < n {
        if mask[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < n && !mask[i] {
            i += 1;
        }
        let interior = start > 0 && i < n;
        if interior && i - start < min_len {
            mask[start..i].iter_mut().for_each(|m| *m = true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_runs_become_annotations() {
        let mut mask = vec![false; 100];
        mask[10..20].iter_mut().for_each(|m| *m = true);
        mask[50..60].iter_mut().for_each(|m| *m = true);
        let a = Annotations::from_mask(&mask, 100.0, 0.0, "BAD_muscle");
        assert_eq!(a.len(), 2);
        let first = a.iter().next().unwrap();
        approx::assert_abs_diff_eq!(first.onset, 0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(first.duration, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn short_good_gap_is_merged() {
        let mut mask = vec![false; 100];
        mask[10..20].iter_mut().for_each(|m| *m = true);
        mask[25..40].iter_mut().for_each(|m| *m = true);
        // 5-sample gap at 100 Hz = 0.05 s < 0.2 s.
        let a = Annotations::from_mask(&mask, 100.0, 0.2, "BAD_muscle");
        assert_eq!(a.len(), 1);
        approx::assert_abs_diff_eq!(a.iter().next().unwrap().duration, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn leading_good_run_is_kept() {
        let mut mask = vec![false; 50];
        mask[3..10].iter_mut().for_each(|m| *m = true);
        let a = Annotations::from_mask(&mask, 100.0, 0.2, "x");
        approx::assert_abs_diff_eq!(a.iter().next().unwrap().onset, 0.03, epsilon = 1e-12);
    }

    #[test]
    fn bad_spans_mask_samples_and_epochs() {
        let mut a = Annotations::new();
        a.push(0.5, 0.25, "BAD_muscle");
        a.push(0.1, 0.1, "Blink");
        a.push(0.9, 0.0, "BAD boundary");
        let mask = a.bad_mask(100, 100.0);
        assert_eq!(mask.iter().filter(|m| **m).count(), 25);
        assert!(!mask[15]);
        assert_eq!(a.first_bad_overlap(0.0, 0.3), None);
        assert_eq!(a.first_bad_overlap(0.7, 0.8), Some("BAD_muscle"));
        assert_eq!(a.first_bad_overlap(0.85, 0.95), Some("BAD boundary"));
    }

    #[test]
    fn extend_keeps_onset_order() {
        let mut a = Annotations::new();
        a.push(5.0, 1.0, "late");
        let mut b = Annotations::new();
        b.push(1.0, 1.0, "early");
        a.extend(&b);
        let onsets: Vec<f64> = a.iter().map(|x| x.onset).collect();
        assert_eq!(onsets, vec![1.0, 5.0]);
    }
}
