use std::path::Path;

use meegprep::config::{FreqBand, NComponents, RejectConfig};
use meegprep::evoked::load_evokeds;
use meegprep::pipeline::find_bad_eeg::{EegBadRow, EEG_BAD_LIST};
use meegprep::pipeline::maxwell_filtering::{MegBadRow, MEG_BAD_LIST};
use meegprep::pipeline::read_csv_rows;
use meegprep::simulate::{simulate_study, SimulationConfig};
use meegprep::{run_all, Epochs, Stage, StudyConfig};

/// Small two-run study with the default faults (EEG007 noisy, MEG0121 flat).
fn small_study(dir: &Path, with_eeg: bool) -> StudyConfig {
    let sim = SimulationConfig {
        run_duration: 24.0,
        n_meg_locations: 24,
        with_eeg,
        ica_components: 5,
        ..SimulationConfig::default()
    };
    let mut cfg = simulate_study(&sim, dir).unwrap();
    // 72 MEG channels cannot carry the default expansion orders
    cfg.maxwell.int_order = 4;
    cfg.maxwell.ext_order = 2;
    cfg.maxwell.bad_window = 2.0;
    cfg.ica.n_components = NComponents::Count(5);
    cfg.epochs.reject = RejectConfig { grad: 1.0, mag: 1.0, eeg: 1.0 };
    cfg.tfr.freq_band = FreqBand::Low;
    cfg.tfr.low.step = 4.0;
    cfg.validate().unwrap();
    cfg
}

fn assert_exists(path: &Path) {
    assert!(path.is_file(), "missing {}", path.display());
}

#[test]
fn full_pipeline_on_simulated_subject() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_study(dir.path(), true);
    run_all(&cfg).unwrap();
    let out = cfg.out_dir();

    for run in cfg.run_names() {
        for suffix in ["_sss.safetensors", "_intpl.safetensors", "_artif.safetensors", "_ica.safetensors", "-eve.txt", "-meta.csv"] {
            assert_exists(&cfg.run_file(&run, suffix));
        }
    }
    for suffix in ["_ALL-ica_meg.safetensors", "_ALL-ica_eeg.safetensors", "_ALL_epo.safetensors", "_ALL_epo.csv", "_ALL-meta.csv"] {
        assert_exists(&cfg.study_file(suffix));
    }
    for stage in Stage::ALL {
        assert_exists(&out.join(format!("{}-report.html", stage.report_name())));
    }

    let meg: Vec<MegBadRow> = read_csv_rows(&out.join(MEG_BAD_LIST)).unwrap();
    assert_eq!(meg.len(), 2);
    assert!(meg.iter().all(|r| r.flat.contains(&"MEG0121".to_string())), "{meg:?}");

    let eeg: Vec<EegBadRow> = read_csv_rows(&out.join(EEG_BAD_LIST)).unwrap();
    assert_eq!(eeg.len(), 2);
    assert!(eeg.iter().all(|r| r.bad.contains(&"EEG007".to_string())), "{eeg:?}");

    let epochs = Epochs::load(&cfg.study_file("_ALL_epo.safetensors")).unwrap();
    assert!(!epochs.is_empty());
    assert_eq!(epochs.metadata.as_ref().map(|m| m.rows.len()), Some(epochs.len()));

    let evokeds = load_evokeds(&cfg.study_file("_ALL_evk-Duration.safetensors")).unwrap();
    assert!(!evokeds.is_empty());
    assert_exists(&out.join(format!("{}_tfr_lofr_Duration.safetensors", cfg.subject_tag())));
}

#[test]
fn subject_without_eeg_skips_bad_eeg_stage() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_study(dir.path(), false);
    assert!(!cfg.has_eeg());
    run_all(&cfg).unwrap();

    for run in cfg.run_names() {
        assert!(!cfg.run_file(&run, "_intpl.safetensors").exists());
        assert_exists(&cfg.run_file(&run, "_artif.safetensors"));
    }
    assert_exists(&cfg.study_file("_ALL-ica_meg.safetensors"));
    assert!(!cfg.study_file("_ALL-ica_eeg.safetensors").exists());
    assert!(!cfg.out_dir().join(EEG_BAD_LIST).exists());
    assert_exists(&cfg.study_file("_ALL_epo.safetensors"));
}
