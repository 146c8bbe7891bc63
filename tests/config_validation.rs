use txn_reconciler::config::ReconcileConfig;
use txn_reconciler::error::EngineError;

#[test]
fn defaults_and_validation_ok() {
    let cfg = ReconcileConfig::new("txn_id", "reference")
        .with_key_pair("currency", "ccy")
        .with_compare_pair("amount", "gross_amount")
        .with_tolerance(0.05);
    assert!(cfg.validate().is_ok());
}

#[test]
fn validation_catches_issues() {
    let bad = ReconcileConfig::default();
    let err = bad.validate().unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("missing required field") || msg.contains("out of range"));
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}

#[test]
fn tolerance_must_be_finite_and_non_negative() {
    assert!(ReconcileConfig::new("a", "b").with_tolerance(0.0).validate().is_ok());
    assert!(ReconcileConfig::new("a", "b").with_tolerance(-0.01).validate().is_err());
    assert!(ReconcileConfig::new("a", "b").with_tolerance(f64::INFINITY).validate().is_err());
}

#[test]
fn config_round_trips_through_json() {
    let cfg = ReconcileConfig::new("txn_id", "reference")
        .with_key_pair("currency", "ccy")
        .with_tolerance(1.5);
    let json = serde_json::to_string(&cfg).unwrap();
    let back: ReconcileConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(cfg, back);
}
