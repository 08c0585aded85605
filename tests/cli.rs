use std::fs;
use std::process::Command;

use fedgwas::accel::Accelerator;
use fedgwas::federate::{AssociationReport, BatchedCoefficients, BatchedSiteStatistics, SiteResiduals};
use ndarray::{Array2, Array3};
use tempfile::tempdir;

fn site(offset: f64, variants: &[&str]) -> (Vec<String>, Array3<f64>, Array2<f64>) {
    let batch = variants.len();
    let nsample = 12;
    let x = Array3::from_shape_fn((batch, nsample, 2), |(b, i, j)| {
        if j == 0 { 1.0 } else { ((i + b) % 3) as f64 }
    });
    let y = Array2::from_shape_fn((batch, nsample), |(b, i)| {
        offset + 0.4 * x[(b, i, 1)] + if i % 2 == 0 { 0.3 } else { -0.2 }
    });
    (variants.iter().map(|v| v.to_string()).collect(), x, y)
}

fn terms() -> Vec<String> {
    vec!["intercept".to_string(), "dosage".to_string()]
}

#[test]
fn combine_solve_report_round_trip() {
    let tmp = tempdir().expect("temporary directory");
    let exe = env!("CARGO_BIN_EXE_fedgwas");

    let sites = [site(0.5, &["rs1", "rs2", "rs3"]), site(0.7, &["rs3", "rs1"])];
    let mut site_paths = Vec::new();
    for (index, (variants, x, y)) in sites.iter().enumerate() {
        let stats = BatchedSiteStatistics::compute(variants.clone(), terms(), x.view(), y.view())
            .expect("site statistics");
        let path = tmp.path().join(format!("site{index}.toml"));
        stats.save(&path).expect("save site statistics");
        site_paths.push(path);
    }

    let combined_path = tmp.path().join("combined.toml");
    let status = Command::new(exe)
        .args(["combine", "--site"])
        .args(&site_paths)
        .arg("--out")
        .arg(&combined_path)
        .status()
        .expect("run fedgwas combine");
    assert!(status.success(), "combine exited with status {status:?}");

    let combined = BatchedSiteStatistics::load(&combined_path).expect("combined statistics");
    assert_eq!(combined.variant_ids, vec!["rs1", "rs3"]);
    assert_eq!(combined.nobs, vec![24, 24]);

    let config_path = tmp.path().join("fit.toml");
    fs::write(&config_path, "solver = \"inverse\"\n").expect("write config");
    let model_path = tmp.path().join("model.toml");
    let status = Command::new(exe)
        .arg("solve")
        .arg("--stats")
        .arg(&combined_path)
        .arg("--config")
        .arg(&config_path)
        .arg("--out")
        .arg(&model_path)
        .status()
        .expect("run fedgwas solve");
    assert!(status.success(), "solve exited with status {status:?}");
    let coefficients = BatchedCoefficients::load(&model_path).expect("coefficients");

    let mut residual_paths = Vec::new();
    for (index, (variants, x, y)) in sites.iter().enumerate() {
        let residuals = SiteResiduals::compute(&coefficients, variants, x.view(), y.view(), &Accelerator::Single)
            .expect("site residuals");
        let path = tmp.path().join(format!("residuals{index}.toml"));
        residuals.save(&path).expect("save residuals");
        residual_paths.push(path);
    }

    let report_path = tmp.path().join("report.tsv");
    let status = Command::new(exe)
        .arg("report")
        .arg("--stats")
        .arg(&combined_path)
        .arg("--model")
        .arg(&model_path)
        .arg("--residuals")
        .args(&residual_paths)
        .arg("--out")
        .arg(&report_path)
        .status()
        .expect("run fedgwas report");
    assert!(status.success(), "report exited with status {status:?}");

    let report = AssociationReport::read_tsv(&report_path).expect("report table");
    assert_eq!(report.rows.len(), 4);
    assert!(report.rows.iter().all(|row| row.dof == 22));
    assert!(report.rows.iter().all(|row| row.standard_error.is_finite()));
}

#[test]
fn qr_is_rejected_for_aggregated_statistics() {
    let tmp = tempdir().expect("temporary directory");
    let exe = env!("CARGO_BIN_EXE_fedgwas");

    let (variants, x, y) = site(0.1, &["rs1"]);
    let stats = BatchedSiteStatistics::compute(variants, terms(), x.view(), y.view()).expect("statistics");
    let stats_path = tmp.path().join("stats.toml");
    stats.save(&stats_path).expect("save statistics");

    let output = Command::new(exe)
        .arg("solve")
        .arg("--stats")
        .arg(&stats_path)
        .args(["--solver", "qr", "--out"])
        .arg(tmp.path().join("model.toml"))
        .output()
        .expect("run fedgwas solve");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("qr"), "unexpected stderr: {stderr}");
}
